//! Transport abstraction traits for Nimbus.
//!
//! A [`Connector`] opens [`Link`]s to a realtime endpoint. The realtime
//! client only ever talks to these traits, so the socket implementation can
//! be swapped (WebSocket in production, in-memory in tests).

use async_trait::async_trait;
use nimbus_protocol::{ClientFrame, ServerFrame};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The transport could not reach the endpoint.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The endpoint refused the upgrade (e.g. 401/403).
    #[error("Connection rejected ({status}): {message}")]
    Rejected {
        /// HTTP status of the refused upgrade.
        status: u16,
        /// Human-readable reason.
        message: String,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] nimbus_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }
}

/// Something that can open links to a realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link to `url`.
    ///
    /// The URL already carries credentials and protocol query parameters.
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open, bidirectional link to the realtime endpoint.
///
/// A link carries typed frames; encoding is the link's concern.
#[async_trait]
pub trait Link: Send {
    /// Receive the next frame from the server.
    ///
    /// Returns `None` if the link is closed cleanly. Must be cancel safe:
    /// dropping the future before it completes loses no frame.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;

    /// Send a frame to the server.
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the link is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_not_retryable() {
        let rejected = TransportError::Rejected {
            status: 401,
            message: "bad key".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::ConnectFailed("refused".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::Rejected {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(err.to_string(), "Connection rejected (403): forbidden");
    }
}
