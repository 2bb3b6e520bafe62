//! # nimbus-protocol
//!
//! Wire protocol definitions for the Nimbus realtime client.
//!
//! This crate defines the named events exchanged between the SDK and the
//! backend realtime endpoint, their codecs, and protocol versioning.
//!
//! ## Frame Types
//!
//! - `ClientFrame` - subscribe/unsubscribe, publish, presence, ping
//! - `ServerFrame` - change feeds, channel messages, presence, workflow,
//!   logic and analytics events, handshake and errors
//!
//! ## Example
//!
//! ```rust
//! use nimbus_protocol::{codec, ClientFrame, TableSubscription};
//!
//! let frame = ClientFrame::subscribe_table(TableSubscription::new("orders"));
//!
//! let text = codec::encode_json(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode_json(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode_json, encode, encode_json, Encoded, Encoding, ProtocolError};
pub use frames::{
    AnalyticsTarget, AnalyticsUpdate, ChangeType, ClientFrame, DatabaseChange, Envelope, LeftMember,
    LogicEvent, PresenceUpdate, PresenceUser, ServerFrame, TableSubscription, WorkflowEvent,
};
pub use version::{Version, PROTOCOL_VERSION};
