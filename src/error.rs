use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;

use crate::transport::SocketState;

/// Broad category of an [`Error`], used to route handling without
/// inspecting the concrete source.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error establishing the socket connection
    Connection,
    /// Error joining a channel
    Join,
    /// Operation referenced a topic that is not in the registry
    Lookup,
    /// Error pushing a message on a joined channel
    Send,
    /// Error at the WebSocket transport layer
    Transport,
    /// Error related to invalid input or state within solesocket
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// The transport failed to reach the open state.
///
/// Carries the socket state observed when the connect attempt settled.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ConnectionError {
    /// Socket state at the time the error notification fired
    pub state: SocketState,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to socket, state is {}", self.state)
    }
}

impl StdError for ConnectionError {}

/// Channel join failure variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum JoinError {
    /// `join_channel` was called before a live singleton exists
    NotInitialized,
    /// The peer declined the join request
    Rejected {
        /// Topic the join was issued for
        topic: String,
        /// Error payload the peer returned with the acknowledgment
        cause: Value,
    },
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => {
                write!(f, "socket singleton is not initialized, cannot join")
            }
            Self::Rejected { topic, cause } => {
                write!(f, "failed to join channel {topic}. Got {cause}")
            }
        }
    }
}

impl StdError for JoinError {}

/// An operation referenced a topic that has not been joined.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum LookupError {
    /// No registry entry exists for the topic
    NotFound {
        /// Topic that was looked up
        topic: String,
    },
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { topic } => write!(f, "channel {topic} does not exist"),
        }
    }
}

impl StdError for LookupError {}

/// Message push failure variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum SendError {
    /// The topic is not joined, so no push was performed
    UnknownChannel {
        /// Topic the push was addressed to
        topic: String,
    },
    /// The peer acknowledged the push with an error status
    Rejected {
        /// Topic the push was issued on
        topic: String,
        /// Error payload the peer returned with the acknowledgment
        cause: Value,
    },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChannel { topic } => {
                write!(f, "channel {topic} does not exist, cannot push")
            }
            Self::Rejected { topic, cause } => {
                write!(f, "push on channel {topic} rejected by peer. Got {cause}")
            }
        }
    }
}

impl StdError for SendError {}

/// WebSocket transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The transport is closed and can no longer carry requests
    Closed,
    /// Received a frame that does not follow the expected wire format
    InvalidFrame(String),
    /// The peer stopped answering heartbeats
    HeartbeatTimeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Closed => write!(f, "WebSocket transport closed"),
            Self::InvalidFrame(msg) => write!(f, "invalid wire frame: {msg}"),
            Self::HeartbeatTimeout => write!(f, "no heartbeat reply from peer"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Error::with_source(Kind::Join, err)
    }
}

impl From<LookupError> for Error {
    fn from(err: LookupError) -> Self {
        Error::with_source(Kind::Lookup, err)
    }
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        Error::with_source(Kind::Send, err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::with_source(Kind::Transport, err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, TransportError::Connection(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn join_rejected_display_includes_topic_and_cause() {
        let err = JoinError::Rejected {
            topic: "room:1".to_owned(),
            cause: json!({"reason": "unauthorized"}),
        };

        assert_eq!(
            err.to_string(),
            r#"failed to join channel room:1. Got {"reason":"unauthorized"}"#
        );
    }

    #[test]
    fn send_unknown_channel_into_error() {
        let err: Error = SendError::UnknownChannel {
            topic: "room:9".to_owned(),
        }
        .into();

        assert_eq!(err.kind(), Kind::Send);
        assert!(err.to_string().contains("room:9"));
        assert!(matches!(
            err.downcast_ref::<SendError>(),
            Some(SendError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn connection_error_carries_state() {
        let err: Error = ConnectionError {
            state: SocketState::Closed,
        }
        .into();

        assert_eq!(err.kind(), Kind::Connection);
        assert!(err.to_string().contains("closed"));
    }
}
