//! In-process transport.
//!
//! [`MemoryConnector`] hands every connection to a paired
//! [`MemoryListener`], which plays the server side. Frames are passed as
//! typed values, so no codec is involved. Used to drive the realtime client
//! in tests and in embedded setups without a network.

use async_trait::async_trait;
use nimbus_protocol::{ClientFrame, ServerFrame};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connector, Link, TransportError};

#[derive(Debug, Default)]
struct Shared {
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

/// Client side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    shared: Arc<Shared>,
}

/// Server side of the in-process transport.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Create a connected connector/listener pair.
    #[must_use]
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        (
            MemoryConnector {
                accept_tx,
                shared: Arc::clone(&shared),
            },
            MemoryListener { accept_rx, shared },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(
                "connection refused by memory listener".into(),
            ));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            from_client,
            to_client: Some(to_client),
        };

        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("memory listener dropped".into()))?;

        debug!(url = %url, "Memory link opened");

        Ok(Box::new(MemoryLink {
            to_server: Some(to_server),
            from_server,
            open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryListener {
    /// Wait for the next client connection.
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take an already queued connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// The server's view of one client link.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    to_client: Option<mpsc::UnboundedSender<ServerFrame>>,
}

impl MemoryPeer {
    /// The URL the client connected with.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a frame to the client.
    ///
    /// Returns `false` if the client side is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Wait for the next frame from the client.
    ///
    /// Returns `None` once the client side is closed.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Take a frame from the client without waiting.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.from_client.try_recv().ok()
    }

    /// Drain every frame the client has sent so far.
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Drop the link from the server side, as a network failure would.
    pub fn close(&mut self) {
        self.to_client = None;
        self.from_client.close();
    }
}

/// Client end of an in-process link.
#[derive(Debug)]
pub struct MemoryLink {
    to_server: Option<mpsc::UnboundedSender<ClientFrame>>,
    from_server: mpsc::UnboundedReceiver<ServerFrame>,
    open: bool,
}

#[async_trait]
impl Link for MemoryLink {
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        match self.from_server.recv().await {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        let sent = match self.to_server.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            self.open = false;
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.to_server = None;
        self.from_server.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
