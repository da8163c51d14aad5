//! Phoenix wire transport over tokio-tungstenite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use dashmap::{DashMap, Entry};
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::wire::Frame;
use super::{Ack, Channel, EventHandler, SocketEvent, SocketState, Transport};
use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::{Error, Result};

/// Broadcast channel capacity for socket events.
const EVENT_CAPACITY: usize = 64;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);

/// Tuning options for [`WsTransport`].
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct WsOptions {
    /// Interval between heartbeats on the reserved `phoenix` topic. A
    /// heartbeat still unanswered when the next one is due closes the
    /// socket.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
        }
    }
}

/// State shared between the transport handle, its channels, and the I/O task.
struct Shared {
    state_tx: watch::Sender<SocketState>,
    event_tx: broadcast::Sender<SocketEvent>,
    sender_tx: mpsc::UnboundedSender<Frame>,
    /// Reply correlation: request ref to the oneshot that settles it
    pending: DashMap<u64, oneshot::Sender<Ack>>,
    /// Persistent event bindings keyed by (topic, event)
    bindings: DashMap<(String, String), EventHandler>,
    next_ref: AtomicU64,
}

impl Shared {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: SocketState) {
        _ = self.state_tx.send(state);
    }

    fn emit(&self, event: SocketEvent) {
        _ = self.event_tx.send(event);
    }

    /// Drop all pending reply slots. Waiters observe the closed oneshot and
    /// surface [`TransportError::Closed`].
    fn fail_pending(&self) {
        self.pending.clear();
    }
}

/// Phoenix-protocol WebSocket transport.
///
/// Connecting spawns a single background I/O task that owns the socket:
/// outgoing frames arrive over an mpsc queue, replies are correlated back to
/// their callers by ref through one-shot slots, and non-reply frames are
/// dispatched to the per-(topic, event) bindings. There is no automatic
/// reconnect: when the socket fails the transport transitions to
/// [`SocketState::Closed`] and stays there.
pub struct WsTransport {
    endpoint: Url,
    options: WsOptions,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SocketState>,
    /// Taken by the I/O task on the first connect
    sender_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    cancel: CancellationToken,
    connect_started: AtomicBool,
}

impl WsTransport {
    /// Construct a transport from connection parameters with default options.
    ///
    /// Validates and expands the endpoint URL; no I/O happens until
    /// [`connect`](Transport::connect).
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        Self::with_options(config, WsOptions::default())
    }

    /// Construct a transport with explicit tuning options.
    pub fn with_options(config: &ConnectionConfig, options: WsOptions) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SocketState::Closed);

        Ok(Self {
            endpoint,
            options,
            shared: Arc::new(Shared {
                state_tx,
                event_tx,
                sender_tx,
                pending: DashMap::new(),
                bindings: DashMap::new(),
                next_ref: AtomicU64::new(1),
            }),
            state_rx,
            sender_rx: Mutex::new(Some(sender_rx)),
            cancel: CancellationToken::new(),
            connect_started: AtomicBool::new(false),
        })
    }

    /// Run the socket I/O loop until cancellation or failure.
    async fn io_loop(
        endpoint: Url,
        options: WsOptions,
        shared: Arc<Shared>,
        mut sender_rx: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) {
        let ws_stream = tokio::select! {
            () = cancel.cancelled() => {
                // Waiters blocked on the event feed must settle too
                shared.set_state(SocketState::Closed);
                shared.emit(SocketEvent::Error("connect cancelled".to_owned()));
                return;
            }
            connected = connect_async(endpoint.as_str()) => match connected {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%endpoint, error = %e, "Unable to connect");
                    shared.set_state(SocketState::Closed);
                    shared.emit(SocketEvent::Error(e.to_string()));
                    return;
                }
            },
        };

        shared.set_state(SocketState::Open);
        shared.emit(SocketEvent::Open);

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = interval(options.heartbeat_interval);
        // Swallow the immediate first tick so the first heartbeat goes out
        // one full interval after open
        heartbeat.tick().await;
        let mut heartbeat_ref: Option<u64> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    shared.set_state(SocketState::Closed);
                    break;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_frame(&shared, text.as_str(), &mut heartbeat_ref);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            shared.emit(SocketEvent::Error("closed by peer".to_owned()));
                            shared.set_state(SocketState::Closed);
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary and ping/pong frames are not part of the
                            // Phoenix protocol; tungstenite answers pings itself
                        }
                        Some(Err(e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "WebSocket read failed");
                            shared.emit(SocketEvent::Error(e.to_string()));
                            shared.set_state(SocketState::Closed);
                            break;
                        }
                    }
                }

                Some(frame) = sender_rx.recv() => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %_e, "Dropping unserializable frame");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        shared.emit(SocketEvent::Error(e.to_string()));
                        shared.set_state(SocketState::Closed);
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    if heartbeat_ref.is_some() {
                        // Previous heartbeat never got a reply
                        #[cfg(feature = "tracing")]
                        tracing::warn!("No heartbeat reply from peer, closing socket");
                        shared.emit(SocketEvent::Error(
                            TransportError::HeartbeatTimeout.to_string(),
                        ));
                        shared.set_state(SocketState::Closed);
                        break;
                    }
                    let reference = shared.next_ref();
                    heartbeat_ref = Some(reference);
                    let frame = Frame::heartbeat(reference);
                    let text = serde_json::to_string(&frame).unwrap_or_default();
                    if write.send(Message::Text(text.into())).await.is_err() {
                        shared.set_state(SocketState::Closed);
                        break;
                    }
                }
            }
        }

        shared.fail_pending();
    }

    /// Route one incoming frame: heartbeat replies, request replies, then
    /// persistent bindings.
    fn handle_frame(shared: &Shared, text: &str, heartbeat_ref: &mut Option<u64>) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %_e, "Failed to parse wire frame");
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(?frame, "Received frame");

        if frame.is_reply() {
            if frame.reference.is_some() && frame.reference == *heartbeat_ref {
                *heartbeat_ref = None;
                return;
            }

            if let Some(reference) = frame.reference
                && let Some((_, reply_tx)) = shared.pending.remove(&reference)
            {
                match frame.reply_ack() {
                    // Receiver may have given up; nothing to do then
                    Some(ack) => _ = reply_tx.send(ack),
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(reference, "Reply without a status field");
                    }
                }
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(reference = ?frame.reference, "Reply with no pending request");
            return;
        }

        match shared
            .bindings
            .get(&(frame.topic.clone(), frame.event.clone()))
        {
            Some(handler) => handler(frame.payload),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    topic = %frame.topic,
                    event = %frame.event,
                    "No binding for event, dropping"
                );
            }
        }
    }
}

impl Transport for WsTransport {
    type Channel = WsChannel;

    fn connect(&self) {
        // At most one live connect attempt per transport
        if self.connect_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(sender_rx) = self.sender_rx.try_lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        self.shared.set_state(SocketState::Connecting);

        let endpoint = self.endpoint.clone();
        let options = self.options.clone();
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            Self::io_loop(endpoint, options, shared, sender_rx, cancel).await;
        });
    }

    fn disconnect(&self) {
        if self.connect_started.load(Ordering::SeqCst) {
            if self.state() != SocketState::Closed {
                self.shared.set_state(SocketState::Closing);
            }
            self.cancel.cancel();
        } else {
            self.shared.set_state(SocketState::Closed);
        }
    }

    fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.event_tx.subscribe()
    }

    fn channel(&self, topic: &str) -> WsChannel {
        WsChannel {
            topic: topic.to_owned(),
            join_ref: AtomicU64::new(0),
            shared: Arc::clone(&self.shared),
            state_rx: self.state_rx.clone(),
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-topic channel handle over a [`WsTransport`].
pub struct WsChannel {
    topic: String,
    /// Ref of the join request, 0 until join is issued
    join_ref: AtomicU64,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SocketState>,
}

impl WsChannel {
    fn join_ref(&self) -> Option<u64> {
        match self.join_ref.load(Ordering::Relaxed) {
            0 => None,
            reference => Some(reference),
        }
    }

    /// Send a ref-carrying frame and await the correlated reply.
    async fn request(&self, frame: Frame, reference: u64) -> Result<Ack> {
        if *self.state_rx.borrow() != SocketState::Open {
            return Err(TransportError::Closed.into());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(reference, reply_tx);
        // Reclaims the slot when the caller gives up before the reply lands
        let _slot = PendingSlot {
            shared: Arc::clone(&self.shared),
            reference,
        };

        if self.shared.sender_tx.send(frame).is_err() {
            return Err(TransportError::Closed.into());
        }

        // The slot is dropped wholesale when the socket dies, which
        // surfaces as Closed here
        reply_rx
            .await
            .map_err(|_| Error::from(TransportError::Closed))
    }
}

/// Removes a reply slot from the pending map when the owning request future
/// is dropped, whether it settled or was abandoned mid-await.
struct PendingSlot {
    shared: Arc<Shared>,
    reference: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.reference);
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn join(&self) -> Result<Ack> {
        let reference = self.shared.next_ref();
        self.join_ref.store(reference, Ordering::Relaxed);
        self.request(Frame::join(&self.topic, reference, json!({})), reference)
            .await
    }

    async fn push(&self, event: &str, payload: Value) -> Result<Ack> {
        let reference = self.shared.next_ref();
        let frame = Frame::push(&self.topic, self.join_ref(), reference, event, payload);
        self.request(frame, reference).await
    }

    fn on(&self, event: &str, handler: EventHandler) -> bool {
        match self
            .shared
            .bindings
            .entry((self.topic.clone(), event.to_owned()))
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handler);
                true
            }
        }
    }

    fn leave(&self) {
        let reference = self.shared.next_ref();
        let frame = Frame::leave(&self.topic, self.join_ref(), reference);
        // Best effort; a closed socket has already forgotten the channel
        _ = self.shared.sender_tx.send(frame);
        self.shared
            .bindings
            .retain(|(topic, _), _| topic != &self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heartbeat_is_thirty_seconds() {
        let options = WsOptions::default();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn transport_starts_closed() {
        let config = ConnectionConfig::builder()
            .url("ws://localhost:4000/socket")
            .build();
        let transport = WsTransport::open(&config).expect("valid config");

        assert_eq!(transport.state(), SocketState::Closed);
        assert!(!transport.is_connected());
    }

    #[test]
    fn open_rejects_invalid_url() {
        let config = ConnectionConfig::builder().url("not a url").build();
        let result = WsTransport::open(&config);
        assert!(result.is_err(), "invalid URL must fail at open");
    }

    #[tokio::test]
    async fn abandoned_request_reclaims_its_pending_slot() {
        let config = ConnectionConfig::builder()
            .url("ws://localhost:4000/socket")
            .build();
        let transport = WsTransport::open(&config).expect("valid config");
        transport.shared.set_state(SocketState::Open);
        let channel = transport.channel("room:1");

        {
            let push = channel.push("msg", json!({}));
            tokio::pin!(push);
            // The first poll registers the reply slot; no reply ever arrives
            assert!(
                futures::poll!(push.as_mut()).is_pending(),
                "push must stay pending without a reply"
            );
            assert_eq!(transport.shared.pending.len(), 1);
        }

        // Dropping the request mid-await must reclaim the slot
        assert!(transport.shared.pending.is_empty());
    }

    #[test]
    fn channel_binding_is_unique_per_event() {
        let config = ConnectionConfig::builder()
            .url("ws://localhost:4000/socket")
            .build();
        let transport = WsTransport::open(&config).expect("valid config");
        let channel = transport.channel("room:1");

        assert!(channel.on("new_msg", Box::new(|_| {})));
        assert!(!channel.on("new_msg", Box::new(|_| {})));
        assert!(channel.on("other", Box::new(|_| {})));
    }
}
