//! # nimbus-realtime
//!
//! Realtime client for the Nimbus backend.
//!
//! One [`RealtimeClient`] holds one connection to the backend's realtime
//! endpoint and multiplexes every subscription over it:
//!
//! - **Tables** - row change feeds, optionally filtered by change type
//! - **Channels** - broadcast pub/sub
//! - **Presence** - who is in a channel, folded into a local cache
//! - **Workflows**, **logic** and **analytics** event streams
//!
//! The client reconnects with exponential backoff when an established
//! session drops and reopens every subscription once the handshake
//! completes again.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Public API │────▶│  Registry   │────▶│ Connection  │──▶ server
//! └─────────────┘     └─────────────┘     │    task     │
//!                            ▲            └─────────────┘
//!                            │                   │
//!                     ┌─────────────┐            │
//!                     │ Dispatcher  │◀───────────┘
//!                     └─────────────┘
//! ```

mod client;
mod connection;
mod dispatch;
pub mod endpoint;
pub mod error;
pub mod listeners;
pub mod metrics;
pub mod options;
pub mod presence;
pub mod registry;
pub mod state;
mod subscription;

pub use client::{RealtimeClient, RealtimeClientBuilder, PRESENCE_REQUEST_TIMEOUT};
pub use error::RealtimeError;
pub use listeners::{ErrorListener, ListenerId, StateListener};
pub use options::RealtimeOptions;
pub use presence::{PresenceCache, PresenceDiff, PresenceLeave};
pub use registry::{SubscriptionId, SubscriptionKey, SubscriptionKind};
pub use state::{ConnectionState, ConnectionStatus};
pub use subscription::Subscription;

pub use nimbus_protocol::{
    AnalyticsTarget, AnalyticsUpdate, ChangeType, DatabaseChange, Encoding, LogicEvent,
    PresenceUser, TableSubscription, WorkflowEvent,
};
