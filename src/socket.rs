//! The socket singleton: connection lifecycle plus the channel registry.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use dashmap::{DashMap, Entry};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, JoinError, LookupError, SendError, TransportError};
use crate::transport::{Ack, Channel as _, EventHandler, SocketEvent, SocketState, Transport};
use crate::transport::ws::WsTransport;
use crate::{Error, Result};

/// Snapshot of the joined topics, keyed by topic.
pub type RegistryView = BTreeMap<String, ChannelInfo>;

/// Information about one joined channel.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Topic this channel is joined on
    pub topic: String,
    /// When the join acknowledgment arrived
    pub joined_at: Instant,
}

/// The live singleton connection: the exclusively owned transport plus its
/// establishment time.
pub struct Connection<T: Transport> {
    transport: Arc<T>,
    established_at: Instant,
}

impl<T: Transport> Connection<T> {
    /// Usage reference into the owned transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current transport state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.transport.state()
    }

    /// When the singleton transport was constructed.
    #[must_use]
    pub fn established_at(&self) -> Instant {
        self.established_at
    }
}

/// Settled result of an in-flight join, shared with concurrent callers for
/// the same topic.
#[derive(Debug, Clone)]
enum JoinOutcome {
    Joined,
    Rejected(Value),
    Failed,
}

struct ChannelEntry<C> {
    channel: Arc<C>,
    joined_at: Instant,
}

type TransportFactory<T> = Box<dyn Fn(&ConnectionConfig) -> Result<T> + Send + Sync>;

struct Inner<T: Transport> {
    factory: TransportFactory<T>,
    /// The process-wide connection slot. First writer wins; `purge` takes it.
    connection: RwLock<Option<Arc<Connection<T>>>>,
    /// Joined channels keyed by topic. At most one entry per topic, inserted
    /// only once the join acknowledgment arrives.
    channels: DashMap<String, ChannelEntry<T::Channel>>,
    /// In-flight joins keyed by topic. Concurrent callers for the same topic
    /// await the owner's outcome instead of issuing a second join.
    pending_joins: DashMap<String, broadcast::Sender<JoinOutcome>>,
}

/// Singleton socket handle: one connection, one registry of joined topics.
///
/// `SoleSocket` is a cheap cloneable handle; every clone shares the same
/// connection slot and registry, making the singleton's lifetime explicit
/// rather than hiding it in global state. The connection is established by
/// [`initialize`](Self::initialize), reused by every caller, and torn down by
/// [`purge`](Self::purge).
///
/// # Examples
///
/// ```no_run
/// use serde_json::json;
/// use solesocket::{ConnectionConfig, SoleSocket};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ConnectionConfig::builder()
///         .url("wss://example.com/socket")
///         .param("jwt", "token")
///         .build();
///     let socket = SoleSocket::new(config);
///
///     socket.initialize().await?;
///     socket.join_channel("room:1").await?;
///
///     let reply = socket
///         .send_message("room:1", "msg", json!({"text": "hi"}))
///         .await?;
///     println!("server replied: {reply}");
///
///     socket.leave_channel("room:1");
///     socket.purge();
///     Ok(())
/// }
/// ```
pub struct SoleSocket<T: Transport = WsTransport> {
    config: ConnectionConfig,
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for SoleSocket<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SoleSocket<WsTransport> {
    /// Create a handle that connects over the Phoenix WebSocket transport.
    ///
    /// No I/O happens until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, WsTransport::open)
    }
}

impl<T: Transport> SoleSocket<T> {
    /// Create a handle with a custom transport factory.
    ///
    /// The factory runs at most once per singleton lifetime, on the first
    /// [`initialize`](Self::initialize) after construction or after a
    /// [`purge`](Self::purge).
    pub fn with_transport<F>(config: ConnectionConfig, factory: F) -> Self
    where
        F: Fn(&ConnectionConfig) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            config,
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                connection: RwLock::new(None),
                channels: DashMap::new(),
                pending_joins: DashMap::new(),
            }),
        }
    }

    /// The connection parameters this handle was constructed with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current connection singleton, or `None` before `initialize` / after
    /// `purge`.
    #[must_use]
    pub fn instance(&self) -> Option<Arc<Connection<T>>> {
        self.inner
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Usage reference to the singleton transport, if present.
    #[must_use]
    pub fn socket(&self) -> Option<Arc<T>> {
        self.instance().map(|conn| Arc::clone(conn.transport()))
    }

    /// Whether both halves of the singleton (connection and transport) are
    /// present.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.instance().is_some() && self.socket().is_some()
    }

    /// Current socket state, `Closed` when no singleton exists.
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.socket()
            .map_or(SocketState::Closed, |transport| transport.state())
    }

    /// Establish or reuse the singleton connection.
    ///
    /// Constructs the transport from the config exactly once (a concurrent
    /// second construction attempt is a no-op, not an error), then connects
    /// or short-circuits if the socket is already open.
    pub async fn initialize(&self) -> Result<SocketState> {
        self.set_instance()?;
        self.connect_to_socket().await
    }

    /// First-writer-wins construction of the singleton transport.
    fn set_instance(&self) -> Result<()> {
        {
            let connection = self
                .inner
                .connection
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if connection.is_some() {
                return Ok(());
            }
        }

        let mut connection = self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connection.is_none() {
            let transport = (self.inner.factory)(&self.config)?;
            *connection = Some(Arc::new(Connection {
                transport: Arc::new(transport),
                established_at: Instant::now(),
            }));
        }

        Ok(())
    }

    /// Connect the singleton transport and await the outcome.
    ///
    /// Fast path: an already-open socket resolves immediately and no second
    /// `connect` is issued to the transport. Otherwise this call subscribes
    /// its own event receiver, issues `connect`, and settles on the first
    /// open or error notification. Concurrent calls each hold their own
    /// receiver tied to the same underlying attempt.
    pub async fn connect_to_socket(&self) -> Result<SocketState> {
        let Some(transport) = self.socket() else {
            return Err(Error::validation(
                "socket singleton is not initialized, cannot connect",
            ));
        };

        if transport.is_connected() {
            return Ok(SocketState::Open);
        }

        // Subscribe before issuing connect so the open notification cannot
        // slip past us
        let mut events = transport.events();
        transport.connect();

        // The socket may have opened between the fast-path check and the
        // subscription; that notification is not replayed on the receiver
        if transport.is_connected() {
            return Ok(SocketState::Open);
        }

        loop {
            match events.recv().await {
                Ok(SocketEvent::Open) => return Ok(SocketState::Open),
                Ok(SocketEvent::Error(_cause)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(cause = %_cause, "Socket connect failed");
                    return Err(ConnectionError {
                        state: transport.state(),
                    }
                    .into());
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(ConnectionError {
                        state: transport.state(),
                    }
                    .into());
                }
            }
        }
    }

    /// Join a topic, or resolve immediately if it is already joined.
    ///
    /// Idempotent per topic: no second join is ever sent to the peer for a
    /// topic already in the registry, and concurrent joins for the same
    /// topic share a single in-flight request. Resolves with a snapshot of
    /// the registry.
    pub async fn join_channel(&self, topic: &str) -> Result<RegistryView> {
        if !self.is_singleton() {
            return Err(JoinError::NotInitialized.into());
        }

        if self.inner.channels.contains_key(topic) {
            return Ok(self.channels());
        }

        self.create_new_channel(topic).await
    }

    /// Issue a join for a topic not yet in the registry.
    async fn create_new_channel(&self, topic: &str) -> Result<RegistryView> {
        // Claim or observe the in-flight join for this topic. The guard must
        // not be held across an await, so the waiter's receiver is carried
        // out of the match.
        let waiter = match self.inner.pending_joins.entry(topic.to_owned()) {
            Entry::Occupied(entry) => Some(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (outcome_tx, _) = broadcast::channel(1);
                entry.insert(outcome_tx);
                None
            }
        };

        if let Some(mut outcome_rx) = waiter {
            #[cfg(feature = "tracing")]
            tracing::debug!(%topic, "Join already in flight, awaiting its outcome");
            return match outcome_rx.recv().await {
                Ok(JoinOutcome::Joined) => Ok(self.channels()),
                Ok(JoinOutcome::Rejected(cause)) => Err(JoinError::Rejected {
                    topic: topic.to_owned(),
                    cause,
                }
                .into()),
                Ok(JoinOutcome::Failed) | Err(_) => Err(TransportError::Closed.into()),
            };
        }

        // We own the claim now; a previous owner may have finished between
        // our registry check and the claim
        if self.inner.channels.contains_key(topic) {
            self.inner.pending_joins.remove(topic);
            return Ok(self.channels());
        }

        let result = self.issue_join(topic).await;

        let outcome = match &result {
            Ok(()) => JoinOutcome::Joined,
            Err(e) => match e.downcast_ref::<JoinError>() {
                Some(JoinError::Rejected { cause, .. }) => JoinOutcome::Rejected(cause.clone()),
                _ => JoinOutcome::Failed,
            },
        };
        if let Some((_, outcome_tx)) = self.inner.pending_joins.remove(topic) {
            _ = outcome_tx.send(outcome);
        }

        result.map(|()| self.channels())
    }

    /// Send exactly one join request and store the entry on `ok`.
    async fn issue_join(&self, topic: &str) -> Result<()> {
        let Some(connection) = self.instance() else {
            return Err(JoinError::NotInitialized.into());
        };

        let channel = Arc::new(connection.transport().channel(topic));

        match channel.join().await? {
            Ack::Ok(_response) => {
                // A purge while the join was in flight replaced or removed
                // the connection; a stale entry must not materialize. The
                // check and insert hold the connection read lock so purge,
                // which takes the slot under the write lock before clearing
                // the registry, cannot slip between them.
                let guard = self
                    .inner
                    .connection
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let still_current = guard
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &connection));
                if !still_current {
                    return Err(TransportError::Closed.into());
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(%topic, "Joined channel");
                self.inner.channels.insert(
                    topic.to_owned(),
                    ChannelEntry {
                        channel,
                        joined_at: Instant::now(),
                    },
                );
                drop(guard);
                Ok(())
            }
            Ack::Error(cause) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%topic, %cause, "Peer rejected join");
                Err(JoinError::Rejected {
                    topic: topic.to_owned(),
                    cause,
                }
                .into())
            }
        }
    }

    /// Look up a joined channel by topic.
    fn get_channel(&self, topic: &str) -> std::result::Result<Arc<T::Channel>, LookupError> {
        self.inner
            .channels
            .get(topic)
            .map(|entry| Arc::clone(&entry.channel))
            .ok_or_else(|| LookupError::NotFound {
                topic: topic.to_owned(),
            })
    }

    /// Register a persistent event handler on a joined channel.
    ///
    /// Idempotent per `(topic, event)`: when a binding for that event
    /// already exists the call is a silent no-op. Fails only when the topic
    /// is not joined.
    pub fn subscribe_to_channel_event(
        &self,
        topic: &str,
        event: &str,
        handler: EventHandler,
    ) -> Result<()> {
        let channel = self.get_channel(topic)?;

        if !channel.on(event, handler) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%topic, %event, "Event binding already exists, skipping");
        }

        Ok(())
    }

    /// Push `(event, payload)` on a joined channel and await the peer reply.
    ///
    /// Each call carries its own correlation, so concurrent sends on the
    /// same topic settle independently. Resolves with the server response
    /// payload.
    pub async fn send_message(&self, topic: &str, event: &str, payload: Value) -> Result<Value> {
        let channel = match self.get_channel(topic) {
            Ok(channel) => channel,
            Err(LookupError::NotFound { topic }) => {
                return Err(SendError::UnknownChannel { topic }.into());
            }
        };

        match channel.push(event, payload).await? {
            Ack::Ok(response) => Ok(response),
            Ack::Error(cause) => Err(SendError::Rejected {
                topic: topic.to_owned(),
                cause,
            }
            .into()),
        }
    }

    /// Leave a topic and drop it from the registry.
    ///
    /// Best effort: leaving a topic that is not joined logs a warning and
    /// returns. No acknowledgment is awaited for the leave itself.
    pub fn leave_channel(&self, topic: &str) {
        match self.inner.channels.remove(topic) {
            Some((_, entry)) => entry.channel.leave(),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%topic, "channel does not exist, cannot leave");
            }
        }
    }

    /// Snapshot of the joined topics.
    #[must_use]
    pub fn channels(&self) -> RegistryView {
        self.inner
            .channels
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    ChannelInfo {
                        topic: entry.key().clone(),
                        joined_at: entry.value().joined_at,
                    },
                )
            })
            .collect()
    }

    /// Tear everything down.
    ///
    /// Disconnects the transport if one exists, then unconditionally clears
    /// the connection singleton, the channel registry, and any in-flight
    /// joins. Channel handles retained elsewhere become unusable.
    pub fn purge(&self) {
        let connection = self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(connection) = connection {
            connection.transport().disconnect();
        }

        self.inner.channels.clear();
        self.inner.pending_joins.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    fn uninitialized() -> SoleSocket {
        SoleSocket::new(
            ConnectionConfig::builder()
                .url("ws://localhost:4000/socket")
                .build(),
        )
    }

    #[tokio::test]
    async fn join_before_initialize_is_not_initialized() {
        let socket = uninitialized();

        let err = socket
            .join_channel("room:1")
            .await
            .expect_err("join without a singleton must fail");

        assert_eq!(err.kind(), Kind::Join);
        assert!(matches!(
            err.downcast_ref::<JoinError>(),
            Some(JoinError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn send_before_join_is_unknown_channel() {
        let socket = uninitialized();

        let err = socket
            .send_message("room:1", "msg", json!({}))
            .await
            .expect_err("send without a join must fail");

        assert_eq!(err.kind(), Kind::Send);
    }

    #[test]
    fn leave_unknown_channel_is_non_fatal() {
        let socket = uninitialized();
        socket.leave_channel("room:1");
        assert!(socket.channels().is_empty());
    }

    #[test]
    fn no_singleton_before_initialize() {
        let socket = uninitialized();

        assert!(socket.instance().is_none());
        assert!(socket.socket().is_none());
        assert!(!socket.is_singleton());
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn connect_without_instance_is_validation_error() {
        let socket = uninitialized();

        let err = socket
            .connect_to_socket()
            .await
            .expect_err("connect without a singleton must fail");

        assert_eq!(err.kind(), Kind::Validation);
    }
}
