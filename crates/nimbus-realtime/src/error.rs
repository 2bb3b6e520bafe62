//! Errors raised by the realtime client.

use nimbus_protocol::{ProtocolError, Version};
use nimbus_transport::TransportError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Realtime client errors.
///
/// Errors are cheap to clone so one failure can be handed to every waiter
/// and every error listener.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    /// An operation needed a live connection.
    #[error("Not connected to realtime server")]
    NotConnected,

    /// The connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The server rejected the API key.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An operation did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Name of the operation.
        operation: &'static str,
        /// Configured limit.
        after: Duration,
    },

    /// Every automatic reconnection attempt failed.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The server reported an error not tied to one subscription.
    #[error("Server error: {message}")]
    Server {
        /// Machine-readable code, when the server sent one.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },

    /// The server refused a subscription.
    #[error("Subscription to {target} failed: {message}")]
    Subscription {
        /// `kind:target` of the subscription.
        target: String,
        /// Reason given by the server.
        message: String,
    },

    /// A subscription callback panicked.
    #[error("Callback for {key} panicked: {message}")]
    Callback {
        /// Subscription key whose handler failed.
        key: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A table, channel or other target name was rejected locally.
    #[error("Invalid target: {0}")]
    InvalidTarget(&'static str),

    /// The server speaks a different major protocol version.
    #[error("Incompatible protocol version: server {server}, client {client}")]
    IncompatibleProtocol {
        /// Version announced by the server.
        server: Version,
        /// Version this client speaks.
        client: Version,
    },

    /// The client was built with unusable settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(Arc<TransportError>),

    /// Encoding or decoding failure.
    #[error(transparent)]
    Protocol(Arc<ProtocolError>),
}

impl RealtimeError {
    /// Whether retrying the connection later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            RealtimeError::Authentication(_)
            | RealtimeError::IncompatibleProtocol { .. }
            | RealtimeError::InvalidConfig(_) => false,
            RealtimeError::Transport(err) => err.is_retryable(),
            _ => true,
        }
    }
}

impl From<TransportError> for RealtimeError {
    fn from(err: TransportError) -> Self {
        RealtimeError::Transport(Arc::new(err))
    }
}

impl From<ProtocolError> for RealtimeError {
    fn from(err: ProtocolError) -> Self {
        RealtimeError::Protocol(Arc::new(err))
    }
}
