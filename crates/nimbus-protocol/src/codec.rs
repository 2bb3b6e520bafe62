//! Codec for encoding and decoding Nimbus frames.
//!
//! Two encodings are supported:
//!
//! - **JSON** text messages, one frame per message (the default)
//! - **MessagePack** binary messages with a 4-byte big-endian length prefix

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Wire encoding of frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    #[serde(rename = "msgpack")]
    MessagePack,
}

/// An encoded frame ready to hand to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Check if the encoded frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a frame with the given encoding.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => encode_json(frame).map(Encoded::Text),
        Encoding::MessagePack => encode_msgpack(frame).map(Encoded::Binary),
    }
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_json<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid frame.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a frame as a length-prefixed MessagePack message.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_msgpack<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a MessagePack frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Read the length prefix at the start of `data`.
///
/// Returns the total size of the frame including its prefix, or `None` if
/// the prefix itself has not fully arrived.
fn framed_size(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut prefix = prefix;
    let length = prefix.get_u32() as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(LENGTH_PREFIX_SIZE + length))
}

/// Decode one complete MessagePack message.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let total = framed_size(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;
    let payload = data
        .get(LENGTH_PREFIX_SIZE..total)
        .ok_or_else(|| ProtocolError::Incomplete(total - data.len()))?;
    Ok(rmp_serde::from_slice(payload)?)
}

/// Take the next MessagePack frame off a receive buffer.
///
/// Binary messages may split or batch frames, so the buffer is only
/// advanced once a whole frame is present. `Ok(None)` means more data is
/// needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    match framed_size(buf)? {
        Some(total) if buf.len() >= total => {
            let frame = buf.split_to(total);
            Ok(Some(rmp_serde::from_slice(&frame[LENGTH_PREFIX_SIZE..])?))
        }
        _ => Ok(None),
    }
}
