//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! JSON frames travel as text messages, MessagePack frames as binary
//! messages.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use nimbus_protocol::{codec, ClientFrame, Encoded, Encoding, Envelope, ProtocolError, ServerFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, trace, warn};

use crate::traits::{Connector, Link, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Frame encoding used on the socket.
    pub encoding: Encoding,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1 MiB
            encoding: Encoding::Json,
        }
    }
}

/// WebSocket connector.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a new WebSocket connector.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Create a connector that speaks the given encoding.
    #[must_use]
    pub fn with_encoding(encoding: Encoding) -> Self {
        Self::new(WebSocketConfig {
            encoding,
            ..Default::default()
        })
    }

    /// Get the connector configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, response) = connect_async(url).await.map_err(|e| match e {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let message = match status {
                    401 => "Unauthorized: realtime endpoint requires a valid API key".to_string(),
                    403 => "Forbidden: access to realtime endpoint denied".to_string(),
                    _ => format!("Upgrade refused with HTTP {}", status),
                };
                TransportError::Rejected { status, message }
            }
            WsError::Io(io) => TransportError::Io(io),
            other => {
                error!("WebSocket handshake failed: {}", other);
                TransportError::ConnectFailed(other.to_string())
            }
        })?;

        debug!(status = %response.status(), "WebSocket handshake completed");

        Ok(Box::new(WebSocketLink::new(stream, &self.config)))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client-side WebSocket link.
pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
    read_buffer: BytesMut,
    max_message_size: usize,
    encoding: Encoding,
}

impl WebSocketLink {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, config: &WebSocketConfig) -> Self {
        Self {
            stream,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
            encoding: config.encoding,
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(
                nimbus_protocol::ProtocolError::FrameTooLarge(len),
            ));
        }
        Ok(())
    }
}

/// Turn an envelope into a frame, or `None` for an event this client does
/// not know.
fn accept(envelope: Envelope) -> Result<Option<ServerFrame>, ProtocolError> {
    if !envelope.is_known() {
        trace!(event = %envelope.event, "Dropping unknown event");
        return Ok(None);
    }
    Ok(Some(envelope.into_frame()?))
}

#[async_trait]
impl Link for WebSocketLink {
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        loop {
            // Binary messages may batch several frames.
            let buffered = match codec::decode_from::<Envelope>(&mut self.read_buffer) {
                Ok(buffered) => buffered,
                Err(err) => {
                    // A bad length prefix leaves nothing to resync on.
                    self.read_buffer.clear();
                    return Err(err.into());
                }
            };
            if let Some(envelope) = buffered {
                if let Some(frame) = accept(envelope)? {
                    return Ok(Some(frame));
                }
                continue;
            }

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    if let Some(frame) = accept(codec::decode_json(&text)?)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!("Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match codec::encode(&frame, self.encoding)? {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(data) => Message::Binary(data.to_vec()),
        };

        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
