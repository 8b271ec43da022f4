//! Length-prefixed framing for TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix. A peer closing the stream between
//! frames is a clean end of stream; closing it inside a frame is an error.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_frame_bytes: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    TooLarge { size: u64, max: u32 },

    /// The peer closed the stream partway through a frame.
    #[error("stream closed mid-frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly before a new frame started.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < len_buf.len() {
        reader.read_exact(&mut len_buf[first..]).await.map_err(map_eof)?;
    }

    let len = u32::from_le_bytes(len_buf);
    if len > config.max_frame_bytes {
        return Err(FrameError::TooLarge {
            size: u64::from(len),
            max: config.max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok(Some(payload))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= config.max_frame_bytes)
        .ok_or(FrameError::TooLarge {
            size: payload.len() as u64,
            max: config.max_frame_bytes,
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
