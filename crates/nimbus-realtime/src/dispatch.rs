//! Inbound frame dispatch.
//!
//! Each frame is routed by the identifier it carries: table name, channel,
//! workflow id, logic name or analytics route. Frames without a matching
//! active subscription are dropped. Callbacks run outside the state lock
//! and a panicking callback is reported to error listeners without
//! disturbing other subscriptions.

use nimbus_protocol::ServerFrame;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, trace, warn};

use crate::client::ClientInner;
use crate::error::RealtimeError;
use crate::listeners::notify;
use crate::metrics;
use crate::registry::{Delivery, SubscriptionKey, SubscriptionKind};
use crate::state::ConnectionStatus;

impl ClientInner {
    /// Route one inbound frame.
    pub(crate) fn dispatch(&self, frame: ServerFrame) {
        metrics::record_frame("inbound");
        if self.options.debug {
            debug!(event = frame.event_name(), ?frame, "Received frame");
        } else {
            trace!(event = frame.event_name(), "Received frame");
        }

        match frame {
            ServerFrame::DatabaseChange(change) => self.route(Delivery::Database(change)),
            ServerFrame::WorkflowEvent(event) => self.route(Delivery::Workflow(event)),
            ServerFrame::LogicEvent(event) => self.route(Delivery::Logic(event)),
            ServerFrame::AnalyticsUpdate(update) => self.route(Delivery::Analytics(update)),

            ServerFrame::ChannelMessage {
                channel, message, ..
            } => {
                let callback = self.state.lock().registry.channel_callback(&channel);
                match callback {
                    Some(callback) => {
                        self.invoke(&format!("channel:{channel}"), "channel", move || {
                            callback(message)
                        });
                    }
                    None => drop_event("channel", &channel),
                }
            }

            ServerFrame::PresenceUpdate(update) => {
                let channel = update.channel.clone();
                let diff = {
                    let mut state = self.state.lock();
                    if state.registry.is_active(&SubscriptionKey::presence(&channel)) {
                        Some(state.presence.apply(update))
                    } else {
                        None
                    }
                };
                match diff {
                    Some(diff) => self.route(Delivery::Presence { channel, diff }),
                    None => drop_event("presence", &channel),
                }
            }

            ServerFrame::PresenceState {
                channel,
                request_id,
                users,
            } => {
                {
                    let mut state = self.state.lock();
                    if state.registry.is_active(&SubscriptionKey::presence(&channel)) {
                        state.presence.replace(&channel, &users);
                    }
                }
                if let Some(request_id) = request_id {
                    match self.pending.remove(&request_id) {
                        Some((_, reply)) => {
                            let _ = reply.send(users);
                        }
                        None => trace!(request_id, "Presence state for an expired request"),
                    }
                }
            }

            ServerFrame::SubscriptionConfirmed {
                kind,
                target,
                subscribers,
            } => {
                debug!(kind = %kind, target = %target, ?subscribers, "Subscription confirmed");
                let mut state = self.state.lock();
                if kind == "channel" {
                    if let Some(subscribers) = subscribers {
                        state.registry.set_channel_subscribers(&target, subscribers);
                    }
                } else if let Some(kind) = SubscriptionKind::from_wire(&kind) {
                    state
                        .registry
                        .set_active(&SubscriptionKey::new(kind, target), true);
                }
            }

            ServerFrame::SubscriptionError {
                kind,
                target,
                message,
            } => {
                warn!(kind = %kind, target = %target, error = %message, "Subscription refused");
                if let Some(parsed) = SubscriptionKind::from_wire(&kind) {
                    self.state
                        .lock()
                        .registry
                        .set_active(&SubscriptionKey::new(parsed, target.as_str()), false);
                }
                self.report_error(RealtimeError::Subscription {
                    target: format!("{kind}:{target}"),
                    message,
                });
            }

            ServerFrame::Error { code, message } => {
                warn!(code = ?code, error = %message, "Server error");
                self.report_error(RealtimeError::Server { code, message });
            }

            ServerFrame::AuthError { message } => {
                warn!(error = %message, "Authentication error on live connection");
                self.report_error(RealtimeError::Authentication(message));
            }

            ServerFrame::Connected { connection_id, .. } => {
                debug!(connection_id = ?connection_id, "Ignoring repeated connected frame");
            }

            ServerFrame::Pong { timestamp } => trace!(?timestamp, "Pong"),
        }
    }

    /// Hand a delivery to the active subscription for its key.
    fn route(&self, delivery: Delivery) {
        let key = delivery.key();
        let handler = self.state.lock().registry.handler(&key);

        match handler {
            Some(handler) => {
                let label = key.to_string();
                let kind = key.kind.as_str();
                self.invoke(&label, kind, move || {
                    if !handler.deliver(delivery) {
                        warn!(key = %key, "Handler kind does not match event");
                    }
                });
            }
            None => drop_event(key.kind.as_str(), &key.target),
        }
    }

    /// Run a callback, turning a panic into an error report.
    fn invoke(&self, key: &str, kind: &'static str, call: impl FnOnce()) {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(()) => metrics::record_dispatched(kind),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(key = %key, error = %message, "Subscription callback panicked");
                metrics::record_callback_error();
                self.report_error(RealtimeError::Callback {
                    key: key.to_string(),
                    message,
                });
            }
        }
    }

    /// Forward an error to every error listener.
    pub(crate) fn report_error(&self, err: RealtimeError) {
        let listeners = self.listeners.lock().error_listeners();
        if listeners.is_empty() {
            debug!(error = %err, "No error listener registered");
        }
        notify(&listeners, &err, "error");
    }

    /// Tell every state listener about a status change.
    pub(crate) fn notify_state(&self, status: &ConnectionStatus) {
        let listeners = self.listeners.lock().state_listeners();
        notify(&listeners, status, "state");
    }
}

fn drop_event(kind: &str, target: &str) {
    trace!(kind, target, "No subscription for event; dropped");
    metrics::record_dropped();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}
