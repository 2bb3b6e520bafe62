//! # nimbus-transport
//!
//! Client transport abstraction layer for the Nimbus realtime client.
//!
//! This crate provides a unified interface for the sockets the client can
//! ride on:
//!
//! - **WebSocket** - The standard, works everywhere
//! - **Memory** - In-process pair for tests and embedding
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Connector` and `Link` traits,
//! allowing the realtime client to be socket-agnostic.
//!
//! ```rust,ignore
//! use nimbus_transport::{Connector, Link};
//!
//! async fn pump(connector: &dyn Connector) {
//!     let mut link = connector.connect("ws://localhost:3000/realtime?apiKey=...").await?;
//!     while let Ok(Some(frame)) = link.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use traits::{Connector, Link, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
