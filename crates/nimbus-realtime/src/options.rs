//! Connection options.

use nimbus_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options controlling how the client connects and reconnects.
///
/// Every field has a default, so a partial TOML table deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeOptions {
    /// Reconnect automatically after an established session drops.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Reconnection attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base reconnection delay in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Upper bound on the reconnection delay in milliseconds.
    #[serde(default = "default_reconnect_delay_max")]
    pub reconnect_delay_max_ms: u64,

    /// Limit on transport connect plus handshake, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Log every inbound and outbound frame at debug level.
    #[serde(default)]
    pub debug: bool,

    /// Path of the realtime endpoint on the API host.
    #[serde(default = "default_path")]
    pub path: String,

    /// Wire encoding.
    #[serde(default)]
    pub encoding: Encoding,
}

impl RealtimeOptions {
    /// Connection timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    ///
    /// Doubles from `reconnect_delay_ms` and saturates at
    /// `reconnect_delay_max_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let cap = self.reconnect_delay_max_ms.max(self.reconnect_delay_ms);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(factor).min(cap))
    }
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            reconnect_delay_max_ms: default_reconnect_delay_max(),
            timeout_ms: default_timeout(),
            debug: false,
            path: default_path(),
            encoding: Encoding::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_reconnect_delay_max() -> u64 {
    5_000
}

fn default_timeout() -> u64 {
    10_000
}

fn default_path() -> String {
    "/realtime".to_string()
}
