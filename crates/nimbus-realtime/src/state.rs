//! Connection state.
//!
//! [`ClientState`] is everything one client owns about its connection: the
//! lifecycle phase, the outbound queue of the live connection task, the
//! subscription registry and the presence cache. It sits behind a single
//! mutex shared by the public API, the connection task and the dispatcher.

use nimbus_protocol::ClientFrame;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RealtimeError;
use crate::presence::PresenceCache;
use crate::registry::Registry;

/// Lifecycle phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Handshake completed; subscriptions flow.
    Connected,
    /// An established session dropped and the client is retrying.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection, as handed to state listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current phase.
    pub state: ConnectionState,
    /// Reconnection attempts made since the session dropped.
    pub reconnect_attempts: u32,
    /// Identifier the server assigned to the current session.
    pub connection_id: Option<String>,
}

/// Lifecycle events produced by the connection task.
#[derive(Debug, Clone)]
pub(crate) enum LifecycleEvent {
    /// First handshake completed.
    Connect { connection_id: Option<String> },
    /// First connection attempt failed.
    ConnectError(RealtimeError),
    /// An established session dropped.
    Disconnect { reason: String },
    /// About to retry; `attempt` is 1-based.
    ReconnectAttempt { attempt: u32 },
    /// One retry failed.
    ReconnectError(RealtimeError),
    /// A retry completed its handshake.
    Reconnect { connection_id: Option<String> },
    /// Retries are exhausted or a retry hit a permanent error.
    ReconnectFailed { attempts: u32 },
}

impl LifecycleEvent {
    /// Event name, for logs.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Connect { .. } => "connect",
            LifecycleEvent::ConnectError(_) => "connect_error",
            LifecycleEvent::Disconnect { .. } => "disconnect",
            LifecycleEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            LifecycleEvent::ReconnectError(_) => "reconnect_error",
            LifecycleEvent::Reconnect { .. } => "reconnect",
            LifecycleEvent::ReconnectFailed { .. } => "reconnect_failed",
        }
    }
}

pub(crate) type ReadyWaiter = oneshot::Sender<Result<(), RealtimeError>>;

/// Mutable state of one client.
#[derive(Debug)]
pub(crate) struct ClientState {
    pub(crate) phase: ConnectionState,
    /// Incremented for every connection task; tasks with an older epoch
    /// are stale and their writes are ignored.
    pub(crate) epoch: u64,
    pub(crate) outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    pub(crate) task: Option<JoinHandle<()>>,
    pub(crate) reconnect_attempts: u32,
    pub(crate) connection_id: Option<String>,
    /// Callers of `connect()` waiting for the current attempt.
    pub(crate) waiters: Vec<ReadyWaiter>,
    pub(crate) registry: Registry,
    pub(crate) presence: PresenceCache,
}

impl ClientState {
    pub(crate) fn new() -> Self {
        Self {
            phase: ConnectionState::Disconnected,
            epoch: 0,
            outbound: None,
            task: None,
            reconnect_attempts: 0,
            connection_id: None,
            waiters: Vec::new(),
            registry: Registry::default(),
            presence: PresenceCache::default(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.phase == ConnectionState::Connected
            && self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Whether a connection task is running for the current epoch.
    pub(crate) fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.phase,
            reconnect_attempts: self.reconnect_attempts,
            connection_id: self.connection_id.clone(),
        }
    }

    /// Queue a frame on the live connection.
    pub(crate) fn send(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        self.outbound
            .as_ref()
            .ok_or(RealtimeError::NotConnected)?
            .send(frame)
            .map_err(|_| RealtimeError::NotConnected)
    }

    /// Resolve every pending `connect()` call.
    pub(crate) fn resolve_waiters(&mut self, result: &Result<(), RealtimeError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Drop the connection handle and forget the session.
    pub(crate) fn detach(&mut self) -> Option<JoinHandle<()>> {
        self.phase = ConnectionState::Disconnected;
        self.outbound = None;
        self.reconnect_attempts = 0;
        self.connection_id = None;
        self.task.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }

    #[test]
    fn test_send_requires_connection() {
        let mut state = ClientState::new();
        let frame = ClientFrame::subscribe_channel("news");
        assert!(matches!(
            state.send(frame.clone()),
            Err(RealtimeError::NotConnected)
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.outbound = Some(tx);
        assert!(state.send(frame.clone()).is_err());

        state.phase = ConnectionState::Connected;
        assert!(state.is_connected());
        state.send(frame.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), frame);

        drop(rx);
        assert!(!state.is_connected());
    }

    #[test]
    fn test_detach_resets_session() {
        let mut state = ClientState::new();
        state.phase = ConnectionState::Reconnecting;
        state.reconnect_attempts = 3;
        state.connection_id = Some("abc".into());

        assert!(state.detach().is_none());
        assert_eq!(
            state.status(),
            ConnectionStatus {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                connection_id: None,
            }
        );
    }
}
