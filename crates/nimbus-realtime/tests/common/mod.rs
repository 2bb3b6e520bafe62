#![allow(dead_code)]

use nimbus_protocol::{ClientFrame, ServerFrame};
use nimbus_realtime::{RealtimeClient, RealtimeOptions};
use nimbus_transport::{MemoryConnector, MemoryListener, MemoryPeer};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn client_with(options: RealtimeOptions) -> (RealtimeClient, MemoryListener) {
    let (connector, listener) = MemoryConnector::pair();
    let client = RealtimeClient::builder()
        .endpoint("memory://test")
        .api_key("test-key")
        .options(options)
        .connector(Arc::new(connector))
        .build()
        .unwrap();
    (client, listener)
}

pub fn client() -> (RealtimeClient, MemoryListener) {
    client_with(RealtimeOptions::default())
}

/// Accept the next link and complete its handshake.
pub async fn accept(listener: &mut MemoryListener, connection_id: &str) -> MemoryPeer {
    let peer = listener.accept().await.expect("listener closed");
    assert!(peer.send(ServerFrame::connected(connection_id)));
    peer
}

/// Connect `client` and return the server side of the link.
pub async fn connect(client: &RealtimeClient, listener: &mut MemoryListener) -> MemoryPeer {
    let (result, peer) = tokio::join!(client.connect(), accept(listener, "conn-1"));
    result.expect("connect failed");
    peer
}

/// Read `n` frames from the client.
pub async fn frames(peer: &mut MemoryPeer, n: usize) -> Vec<ClientFrame> {
    let mut frames = Vec::with_capacity(n);
    for _ in 0..n {
        frames.push(peer.recv().await.expect("client link closed"));
    }
    frames
}

/// A callback that forwards whatever it receives to a channel.
pub fn collector<T: Send + 'static>() -> (impl Fn(T) + Send + Sync + 'static, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |value: T| {
            let _ = tx.send(value);
        },
        rx,
    )
}
