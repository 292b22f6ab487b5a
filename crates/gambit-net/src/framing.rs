//! Length-prefixed framing for TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   body             |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length excludes the prefix itself. Zero-length frames are legal and
//! carry nothing; readers skip them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed body size in bytes. Default: 1 MiB.
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
    /// The body size exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: u32 },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed mid-frame")]
    Truncated,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, config: FrameConfig) -> Self {
        Self { reader, config }
    }

    /// Read the next non-empty frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
    /// boundary, and [`FrameError::Truncated`] when it closed mid-frame.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let mut len_buf = [0u8; 4];
            let first = self.reader.read(&mut len_buf[..1]).await?;
            if first == 0 {
                return Ok(None);
            }
            self.read_exact_or_truncated(&mut len_buf[1..]).await?;

            let len = u32::from_le_bytes(len_buf);
            if len > self.config.max_frame_bytes {
                return Err(FrameError::TooLarge {
                    size: len as usize,
                    max: self.config.max_frame_bytes,
                });
            }
            if len == 0 {
                continue;
            }

            let mut body = vec![0u8; len as usize];
            self.read_exact_or_truncated(&mut body).await?;
            return Ok(Some(body));
        }
    }

    async fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= config.max_frame_bytes)
        .ok_or(FrameError::TooLarge {
            size: body.len(),
            max: config.max_frame_bytes,
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
