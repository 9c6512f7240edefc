#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;

/// Transport and connection-attempt failures.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "ws")]
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// HTTP request of a polling transport failed
    Http(reqwest::Error),
    /// Polling endpoint answered with an unexpected status
    Status(StatusCode),
    /// Received a frame the transport cannot interpret
    InvalidFrame(String),
    /// Transport closed before it opened
    Closed {
        /// Name of the transport that closed
        transport: String,
    },
    /// A connection attempt did not finish in time
    Timeout(Duration),
    /// No strategy in the tree is supported in this environment
    Unsupported,
    /// Every strategy in the tree failed
    Exhausted,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "ws")]
            Self::WebSocket(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Http(e) => write!(f, "HTTP transport error: {e}"),
            Self::Status(status) => write!(f, "unexpected HTTP status {status}"),
            Self::InvalidFrame(frame) => write!(f, "invalid transport frame: {frame}"),
            Self::Closed { transport } => write!(f, "transport {transport} closed"),
            Self::Timeout(after) => write!(f, "connection attempt timed out after {after:?}"),
            Self::Unsupported => write!(f, "no supported transport"),
            Self::Exhausted => write!(f, "all connection strategies failed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "ws")]
            Self::WebSocket(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

#[cfg(feature = "ws")]
impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(
            crate::error::Kind::Transport,
            TransportError::WebSocket(e),
        )
    }
}
