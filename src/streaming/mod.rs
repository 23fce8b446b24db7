//! WebSocket streaming of PCM frames
//!
//! # Architecture
//!
//! ```text
//!  capture thread                  connection task (single writer)
//!  ──────────────                  ───────────────────────────────
//!  PcmFrame ──▶ FrameSender ──▶ send slot ◀── publish(state, socket)
//!                   │ (try_send)                    ▲
//!                   ▼                               │ reduce(link, event)
//!             socket writer task ──▶ server         │
//!                   │                               │
//!                   └── Opened / Failed / Closed / Text ──┘
//! ```
//!
//! All state transitions go through [`connection::reduce`]. Socket callbacks
//! carry the attempt id they were opened with; events from a retired attempt
//! are dropped.
//!
//! There is no automatic reconnection. After `Error` the caller decides
//! whether to connect again.

pub mod connection;
pub mod credentials;
pub mod protocol;
mod transcript;
pub mod transport;

pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, FrameSender, StreamStats,
};
pub use credentials::fetch_stream_token;
pub use protocol::{
    decode_text, ConnectRequest, Endpoint, EndpointKind, Inbound, Transcript, DEFAULT_WS_URL,
};
pub use transcript::TranscriptAggregator;
pub use transport::{Connector, Socket, SocketEvents, WriteError, WsConnector};

/// Errors from the streaming side
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// No open event within the connect timeout
    ConnectionTimeout,
    /// Socket-level failure (handshake, I/O, protocol)
    TransportError(String),
    /// A frame was not handed to the socket
    SendDropped(String),
    /// Inbound message could not be decoded
    DecodeError(String),
    /// Endpoint URL is not a usable ws:// or wss:// URL
    InvalidUrl(String),
    /// Stream token could not be obtained
    Credentials(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::ConnectionTimeout => write!(f, "Connection timed out"),
            StreamingError::TransportError(msg) => write!(f, "WebSocket error: {}", msg),
            StreamingError::SendDropped(msg) => write!(f, "Frame dropped: {}", msg),
            StreamingError::DecodeError(msg) => write!(f, "Failed to decode message: {}", msg),
            StreamingError::InvalidUrl(msg) => write!(f, "Invalid WebSocket URL: {}", msg),
            StreamingError::Credentials(msg) => write!(f, "Failed to get stream token: {}", msg),
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            StreamingError::ConnectionTimeout.to_string(),
            "Connection timed out"
        );
        assert!(StreamingError::TransportError("reset".into())
            .to_string()
            .contains("reset"));
        assert!(StreamingError::SendDropped("not connected".into())
            .to_string()
            .starts_with("Frame dropped"));
    }
}
