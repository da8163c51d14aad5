//! Transport and channel capability traits.
//!
//! The socket core only ever talks to these interfaces. The crate ships one
//! real implementation ([`WsTransport`], Phoenix wire over tokio-tungstenite);
//! tests plug in scripted fakes through the same seams.
//!
//! # Architecture
//!
//! - [`Transport`]: the persistent full-duplex socket — connect/disconnect,
//!   state queries, an event feed, and a per-topic [`Channel`] factory
//! - [`Channel`]: a per-topic handle — join/push/leave and persistent event
//!   bindings
//! - [`Ack`]: the one-shot status-tagged peer acknowledgment a join or push
//!   settles on

pub mod wire;
pub mod ws;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

pub use ws::WsTransport;

/// Persistent handler for a channel event binding.
pub type EventHandler = Box<dyn Fn(Value) + Send + Sync + 'static>;

/// Lifecycle state of the underlying socket.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SocketState {
    /// Connect issued, no open or error notification yet
    Connecting,
    /// Socket is open and can carry channel traffic
    Open,
    /// Disconnect issued, close handshake in flight
    Closing,
    /// Socket is closed
    Closed,
}

/// Socket-level notification emitted by the transport.
///
/// Every event also updates [`Transport::state`], so late subscribers can
/// fall back on the state query.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The socket reached the open state
    Open,
    /// The socket failed; carries a human-readable cause
    Error(String),
}

/// One-shot peer acknowledgment for a join or push request.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Peer accepted; carries the server response payload
    Ok(Value),
    /// Peer declined; carries the error payload
    Error(Value),
}

/// The persistent socket the singleton connection owns.
///
/// Implementations must derive `state()` from their own I/O progress and
/// mirror every open/error transition onto the [`events`](Self::events)
/// feed. `connect` must be idempotent: at most one live connect attempt is
/// ever in flight regardless of how often it is called.
pub trait Transport: Send + Sync + 'static {
    /// Per-topic channel handle type produced by this transport.
    type Channel: Channel;

    /// Begin connecting. Non-blocking; progress is reported through
    /// [`events`](Self::events).
    fn connect(&self);

    /// Tear the socket down. Safe to call on an already-closed transport.
    fn disconnect(&self);

    /// Current socket state.
    fn state(&self) -> SocketState;

    /// Whether the socket is currently open.
    fn is_connected(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Subscribe to socket open/error notifications.
    ///
    /// Each call returns an independent receiver; concurrent connect waiters
    /// each hold their own, all tied to the same underlying attempt.
    fn events(&self) -> broadcast::Receiver<SocketEvent>;

    /// Obtain a fresh channel handle for `topic`. Does not join it.
    fn channel(&self, topic: &str) -> Self::Channel;
}

/// A per-topic channel multiplexed over the transport.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Topic this channel is bound to.
    fn topic(&self) -> &str;

    /// Issue the join request and await the peer acknowledgment.
    ///
    /// Resolves with [`Ack::Ok`] or [`Ack::Error`]; `Err` is reserved for
    /// transport-level failure (e.g. the socket closed underneath).
    async fn join(&self) -> crate::Result<Ack>;

    /// Push `(event, payload)` and await the peer acknowledgment.
    ///
    /// Each push carries its own correlation ref, so concurrent pushes on
    /// the same channel settle independently.
    async fn push(&self, event: &str, payload: Value) -> crate::Result<Ack>;

    /// Register a persistent event binding.
    ///
    /// Returns `false` (dropping `handler`) when a binding for `event`
    /// already exists; there is never more than one handler per event.
    fn on(&self, event: &str, handler: EventHandler) -> bool;

    /// Issue the leave request. Fire-and-forget; no acknowledgment awaited.
    fn leave(&self);
}
