//! Envelope encoding: postcard body, protocol version byte, optional LZ4.
//!
//! ```text
//! +-----------+------------------------------------------------+
//! | flag (u8) | body                                           |
//! +-----------+------------------------------------------------+
//!   0x00        [version: u8] [postcard Envelope]
//!   0x01        lz4( [version: u8] [postcard Envelope] ), size-prepended
//! ```
//!
//! The result is what goes inside one frame (see [`crate::framing`]). Large
//! snapshots dominate traffic, so only bodies at or above the threshold are
//! compressed.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::messages::Envelope;

/// Current wire-protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Compression flag: body is stored as-is.
pub const FLAG_PLAIN: u8 = 0x00;

/// Compression flag: body is LZ4 compressed with its size prepended.
pub const FLAG_LZ4: u8 = 0x01;

/// Controls when bodies are compressed.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum body size (bytes) before compression is applied. Default: 256.
    pub compression_threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub compression_enabled: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 256,
            compression_enabled: true,
        }
    }
}

/// Errors produced while decoding (or, rarely, encoding) an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame was empty.
    #[error("empty frame")]
    Empty,

    /// Unknown compression flag byte.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),

    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Decompress(String),

    /// The body does not start with [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode an envelope into a frame body.
pub fn encode_envelope(envelope: &Envelope, config: &CodecConfig) -> Result<Vec<u8>, CodecError> {
    let encoded = postcard::to_allocvec(envelope)?;
    let mut body = Vec::with_capacity(1 + encoded.len());
    body.push(PROTOCOL_VERSION);
    body.extend_from_slice(&encoded);

    if config.compression_enabled && body.len() >= config.compression_threshold {
        let compressed = compress_prepend_size(&body);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(FLAG_LZ4);
        out.extend_from_slice(&compressed);
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(FLAG_PLAIN);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Decode a frame body into an envelope.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, CodecError> {
    let (&flag, rest) = data.split_first().ok_or(CodecError::Empty)?;

    let inflated;
    let body: &[u8] = match flag {
        FLAG_PLAIN => rest,
        FLAG_LZ4 => {
            inflated = decompress_size_prepended(rest)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
            &inflated
        }
        other => return Err(CodecError::UnknownFlag(other)),
    };

    let (&version, encoded) = body.split_first().ok_or(CodecError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    Ok(postcard::from_bytes(encoded)?)
}
