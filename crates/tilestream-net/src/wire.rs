//! Full message pipeline: `Message` ⇄ version byte + postcard ⇄ flag byte +
//! optional LZ4 ⇄ length-prefixed frame.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::messages::{Message, MessageError, deserialize_message, serialize_message};

/// Framing and compression settings shared by both ends of a connection.
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    pub frame: FrameConfig,
    pub compression: CompressionConfig,
}

impl WireConfig {
    /// Settings from the two configurable knobs; compression stays enabled.
    pub fn new(max_frame_bytes: u32, compression_threshold: usize) -> Self {
        Self {
            frame: FrameConfig { max_frame_bytes },
            compression: CompressionConfig {
                threshold: compression_threshold,
                enabled: true,
            },
        }
    }
}

/// Errors from encoding, decoding, or moving a message over a stream.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(#[from] postcard::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Encode a message into a frame payload (without the length prefix).
pub fn encode_message(msg: &Message, config: &WireConfig) -> Result<Vec<u8>, WireError> {
    let bytes = serialize_message(msg)?;
    Ok(compress_payload(&bytes, &config.compression))
}

/// Decode a frame payload produced by [`encode_message`].
pub fn decode_message(payload: &[u8]) -> Result<Message, WireError> {
    let bytes = decompress_payload(payload)?;
    Ok(deserialize_message(&bytes)?)
}

/// Encode and write one message as a frame.
pub async fn send_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Message,
    config: &WireConfig,
) -> Result<(), WireError> {
    let payload = encode_message(msg, config)?;
    write_frame(writer, &payload, &config.frame).await?;
    Ok(())
}

/// Read and decode one message. `Ok(None)` on a clean end of stream.
pub async fn recv_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &WireConfig,
) -> Result<Option<Message>, WireError> {
    match read_frame(reader, &config.frame).await? {
        Some(payload) => Ok(Some(decode_message(&payload)?)),
        None => Ok(None),
    }
}
