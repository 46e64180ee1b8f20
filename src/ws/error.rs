#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// WebSocket error variants.
///
/// Cheap to clone so the same failure can be handed to every pending `connect()` caller, the
/// error hook and the state snapshot.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(Arc<tokio_tungstenite::tungstenite::Error>),
    /// The opening handshake did not finish within the configured timeout
    Timeout(Duration),
    /// WebSocket connection was closed by the peer or the network
    ConnectionClosed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer
        reason: String,
    },
    /// Operation requires an open connection and queueing could not absorb it
    NotConnected,
    /// The manager was shut down with `disconnect()` and must be re-armed with `reconnect()`
    Shutdown,
    /// Error serializing an outbound message
    MessageParse(Arc<serde_json::Error>),
    /// Received an invalid or unexpected message
    InvalidMessage(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Timeout(after) => write!(f, "WebSocket open timed out after {after:?}"),
            Self::ConnectionClosed { code: Some(code), reason } => {
                write!(f, "WebSocket connection closed ({code}): {reason}")
            }
            Self::ConnectionClosed { code: None, .. } => write!(f, "WebSocket connection closed"),
            Self::NotConnected => write!(f, "WebSocket is not connected"),
            Self::Shutdown => write!(f, "WebSocket manager has been shut down"),
            Self::MessageParse(e) => write!(f, "Failed to serialize WebSocket message: {e}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e.as_ref()),
            Self::MessageParse(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(Arc::new(e))
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::MessageParse(_) => crate::error::Kind::Internal,
            _ => crate::error::Kind::WebSocket,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::from(e).into()
    }
}
