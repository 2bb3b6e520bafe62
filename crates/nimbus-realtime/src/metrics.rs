//! Client metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const FRAMES_TOTAL: &str = "nimbus_realtime_frames_total";
    pub const EVENTS_DISPATCHED_TOTAL: &str = "nimbus_realtime_events_dispatched_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "nimbus_realtime_events_dropped_total";
    pub const CALLBACK_ERRORS_TOTAL: &str = "nimbus_realtime_callback_errors_total";
    pub const RECONNECTS_TOTAL: &str = "nimbus_realtime_reconnects_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "nimbus_realtime_subscriptions_active";
}

/// Describe every metric to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::FRAMES_TOTAL,
        "Frames exchanged with the realtime server"
    );
    metrics::describe_counter!(
        names::EVENTS_DISPATCHED_TOTAL,
        "Events handed to subscription callbacks"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Inbound events with no matching subscription"
    );
    metrics::describe_counter!(
        names::CALLBACK_ERRORS_TOTAL,
        "Subscription callbacks that panicked"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Successful reconnections");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Subscriptions and channels currently registered"
    );
}

pub(crate) fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

pub(crate) fn record_dispatched(kind: &'static str) {
    counter!(names::EVENTS_DISPATCHED_TOTAL, "kind" => kind).increment(1);
}

pub(crate) fn record_dropped() {
    counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
}

pub(crate) fn record_callback_error() {
    counter!(names::CALLBACK_ERRORS_TOTAL).increment(1);
}

pub(crate) fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

pub(crate) fn set_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}
