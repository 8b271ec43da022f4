//! Conditional LZ4 compression for network payloads.
//!
//! Chunk parts with tile grids are large and compress well; acks, requests
//! and pings are tiny and are sent as-is behind a flag byte.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Payload is stored as-is.
pub const FLAG_RAW: u8 = 0x00;

/// Payload is an LZ4 block with its size prepended.
pub const FLAG_LZ4: u8 = 0x01;

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Payloads of at least this many bytes are compressed. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    fn should_compress(&self, len: usize) -> bool {
        self.enabled && len >= self.threshold
    }
}

/// Prefix `data` with a flag byte, compressing it when it is large enough.
///
/// Falls back to the raw form if LZ4 would not make it smaller.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if config.should_compress(data.len()) {
        let compressed = compress_prepend_size(data);
        if compressed.len() < data.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(FLAG_RAW);
    out.extend_from_slice(data);
    out
}

/// Strip the flag byte and decompress if needed.
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match data.split_first() {
        None => Err(CompressionError::EmptyPayload),
        Some((&FLAG_RAW, body)) => Ok(body.to_vec()),
        Some((&FLAG_LZ4, body)) => Ok(decompress_size_prepended(body)?),
        Some((&flag, _)) => Err(CompressionError::UnknownFlag(flag)),
    }
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("empty payload, no compression flag")]
    EmptyPayload,
    #[error("LZ4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}
