//! Background connection task.
//!
//! One task per live connection owns the [`Link`]. It performs the
//! handshake, pumps outbound frames from the client's queue, hands inbound
//! frames to the dispatcher and, when an established session drops,
//! reconnects with exponential backoff.
//!
//! The task only holds a weak reference to the client between events, so
//! dropping the last client handle stops it. Every lifecycle event carries
//! the task's epoch; once `disconnect()` or a new `connect()` has moved the
//! epoch on, the task's events are ignored and it exits.

use nimbus_protocol::{ClientFrame, ServerFrame, Version, PROTOCOL_VERSION};
use nimbus_transport::{Connector, Link, TransportError};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::client::ClientInner;
use crate::error::RealtimeError;
use crate::metrics;
use crate::options::RealtimeOptions;
use crate::state::{ConnectionState, LifecycleEvent};

/// Why a session ended.
enum SessionEnd {
    /// The link dropped; reconnection may follow.
    Dropped(String),
    /// The client went away; the task must stop.
    Closed,
}

/// Entry point of the connection task.
pub(crate) async fn run(
    client: Weak<ClientInner>,
    epoch: u64,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    connector: Arc<dyn Connector>,
    url: String,
    options: RealtimeOptions,
) {
    debug!(transport = connector.name(), "Connection task started");

    let mut link = match establish(connector.as_ref(), &url, &options).await {
        Ok((link, connection_id)) => {
            if !lifecycle(&client, epoch, LifecycleEvent::Connect { connection_id }) {
                return;
            }
            link
        }
        Err(err) => {
            lifecycle(&client, epoch, LifecycleEvent::ConnectError(err));
            return;
        }
    };

    loop {
        let end = session(&client, link.as_mut(), &mut outbound, options.debug).await;
        if let Err(err) = link.close().await {
            trace!(error = %err, "Closing dropped link failed");
        }

        let reason = match end {
            SessionEnd::Dropped(reason) => reason,
            SessionEnd::Closed => {
                debug!("Connection task stopped");
                return;
            }
        };

        if !lifecycle(&client, epoch, LifecycleEvent::Disconnect { reason }) || !options.auto_reconnect {
            return;
        }

        match reconnect(&client, epoch, connector.as_ref(), &url, &options, &mut outbound).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

/// Forward a lifecycle event to the client.
///
/// Returns `false` if the client is gone or the task is stale.
fn lifecycle(client: &Weak<ClientInner>, epoch: u64, event: LifecycleEvent) -> bool {
    match client.upgrade() {
        Some(inner) => inner.on_lifecycle(epoch, event),
        None => false,
    }
}

/// Open a link and wait for the `connected` frame, bounded by the
/// configured timeout.
async fn establish(
    connector: &dyn Connector,
    url: &str,
    options: &RealtimeOptions,
) -> Result<(Box<dyn Link>, Option<String>), RealtimeError> {
    let limit = options.timeout();
    match tokio::time::timeout(limit, handshake(connector, url)).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::Timeout {
            operation: "connect",
            after: limit,
        }),
    }
}

async fn handshake(
    connector: &dyn Connector,
    url: &str,
) -> Result<(Box<dyn Link>, Option<String>), RealtimeError> {
    let mut link = connector.connect(url).await?;

    loop {
        let frame = match link.recv().await {
            Ok(frame) => frame,
            Err(TransportError::Protocol(err)) => {
                warn!(error = %err, "Dropping undecodable frame before handshake");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        match frame {
            Some(ServerFrame::Connected {
                connection_id,
                version,
            }) => {
                if let Some(version) = version {
                    let server: Version = version.parse()?;
                    if !PROTOCOL_VERSION.is_compatible_with(&server) {
                        let _ = link.close().await;
                        return Err(RealtimeError::IncompatibleProtocol {
                            server,
                            client: PROTOCOL_VERSION,
                        });
                    }
                }
                return Ok((link, connection_id));
            }
            Some(ServerFrame::AuthError { message }) => {
                let _ = link.close().await;
                return Err(RealtimeError::Authentication(message));
            }
            Some(frame) => {
                trace!(event = frame.event_name(), "Ignoring frame before handshake");
            }
            None => {
                return Err(RealtimeError::ConnectFailed(
                    "connection closed during handshake".into(),
                ))
            }
        }
    }
}

/// Pump frames until the link drops or the client goes away.
async fn session(
    client: &Weak<ClientInner>,
    link: &mut dyn Link,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    log_frames: bool,
) -> SessionEnd {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Closed;
                };
                if log_frames {
                    debug!(event = frame.event_name(), ?frame, "Sending frame");
                } else {
                    trace!(event = frame.event_name(), "Sending frame");
                }
                if let Err(err) = link.send(frame).await {
                    return SessionEnd::Dropped(format!("send failed: {err}"));
                }
                metrics::record_frame("outbound");
            }
            inbound = link.recv() => match inbound {
                Ok(Some(frame)) => {
                    let Some(inner) = client.upgrade() else {
                        return SessionEnd::Closed;
                    };
                    inner.dispatch(frame);
                }
                Ok(None) => return SessionEnd::Dropped("server closed the connection".into()),
                Err(TransportError::Protocol(err)) => {
                    // One undecodable frame; the socket itself is fine.
                    warn!(error = %err, "Dropping undecodable frame");
                    if let Some(inner) = client.upgrade() {
                        inner.report_error(err.into());
                    }
                }
                Err(err) => return SessionEnd::Dropped(err.to_string()),
            }
        }
    }
}

/// Retry until a handshake succeeds or attempts run out.
async fn reconnect(
    client: &Weak<ClientInner>,
    epoch: u64,
    connector: &dyn Connector,
    url: &str,
    options: &RealtimeOptions,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
) -> Option<Box<dyn Link>> {
    let max = options.max_reconnect_attempts;

    for attempt in 1..=max {
        if !lifecycle(client, epoch, LifecycleEvent::ReconnectAttempt { attempt }) {
            return None;
        }
        tokio::time::sleep(options.backoff(attempt)).await;

        match establish(connector, url, options).await {
            Ok((link, connection_id)) => {
                // Frames queued for the dead link are superseded by the
                // resubscription that follows.
                let mut stale = 0usize;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "Discarded frames queued before reconnect");
                }
                return lifecycle(client, epoch, LifecycleEvent::Reconnect { connection_id })
                    .then_some(link);
            }
            Err(err) => {
                let fatal = !err.is_retryable();
                if !lifecycle(client, epoch, LifecycleEvent::ReconnectError(err)) {
                    return None;
                }
                if fatal {
                    lifecycle(client, epoch, LifecycleEvent::ReconnectFailed { attempts: attempt });
                    return None;
                }
            }
        }
    }

    lifecycle(client, epoch, LifecycleEvent::ReconnectFailed { attempts: max });
    None
}

impl ClientInner {
    /// Apply a lifecycle event to the client state.
    ///
    /// Returns `false` if the event came from a stale task.
    pub(crate) fn on_lifecycle(&self, epoch: u64, event: LifecycleEvent) -> bool {
        let mut errors = Vec::new();
        let mut resubscribe = false;

        let changed = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                debug!(event = event.name(), "Ignoring event from stale connection");
                return false;
            }
            let before = state.status();

            match event {
                LifecycleEvent::Connect { connection_id } => {
                    info!(connection_id = ?connection_id, "Connected to realtime server");
                    state.phase = ConnectionState::Connected;
                    state.reconnect_attempts = 0;
                    state.connection_id = connection_id;
                    state.resolve_waiters(&Ok(()));
                    // Entries survive an exhausted reconnect; reopen them.
                    resubscribe = !state.registry.is_empty();
                }
                LifecycleEvent::ConnectError(err) => {
                    warn!(error = %err, "Connection failed");
                    state.detach();
                    state.resolve_waiters(&Err(err.clone()));
                    errors.push(err);
                }
                LifecycleEvent::Disconnect { reason } => {
                    warn!(reason = %reason, "Connection lost");
                    if self.options.auto_reconnect {
                        state.phase = ConnectionState::Reconnecting;
                        state.reconnect_attempts = 0;
                        state.connection_id = None;
                    } else {
                        state.detach();
                    }
                    self.pending.clear();
                }
                LifecycleEvent::ReconnectAttempt { attempt } => {
                    info!(
                        attempt,
                        max = self.options.max_reconnect_attempts,
                        "Reconnecting"
                    );
                    state.phase = ConnectionState::Reconnecting;
                    state.reconnect_attempts = attempt;
                }
                LifecycleEvent::ReconnectError(err) => {
                    warn!(attempt = state.reconnect_attempts, error = %err, "Reconnection attempt failed");
                    errors.push(err);
                }
                LifecycleEvent::Reconnect { connection_id } => {
                    info!(
                        connection_id = ?connection_id,
                        attempts = state.reconnect_attempts,
                        "Reconnected to realtime server"
                    );
                    state.phase = ConnectionState::Connected;
                    state.reconnect_attempts = 0;
                    state.connection_id = connection_id;
                    state.resolve_waiters(&Ok(()));
                    metrics::record_reconnect();
                    resubscribe = true;
                }
                LifecycleEvent::ReconnectFailed { attempts } => {
                    error!(attempts, "Giving up on reconnection");
                    let err = RealtimeError::ReconnectFailed { attempts };
                    state.detach();
                    state.resolve_waiters(&Err(err.clone()));
                    self.pending.clear();
                    errors.push(err);
                }
            }

            let after = state.status();
            (before != after).then_some(after)
        };

        if let Some(status) = changed {
            self.notify_state(&status);
        }
        for err in errors {
            self.report_error(err);
        }
        if resubscribe {
            self.resubscribe_all();
        }
        true
    }

    /// Re-emit the subscribe frame of every active entry and channel.
    ///
    /// A failure is logged and forwarded; the remaining entries are still
    /// replayed.
    pub(crate) fn resubscribe_all(&self) {
        let failures: Vec<RealtimeError> = {
            let state = self.state.lock();
            let frames = state.registry.replay();
            info!(count = frames.len(), "Resubscribing");

            frames
                .into_iter()
                .filter_map(|(key, frame)| match state.send(frame) {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(key = %key, error = %err, "Resubscription failed");
                        Some(RealtimeError::Subscription {
                            target: key,
                            message: err.to_string(),
                        })
                    }
                })
                .collect()
        };

        for err in failures {
            self.report_error(err);
        }
    }
}
