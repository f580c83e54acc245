//! Newline-delimited JSON framing
//!
//! One JSON document per line. Lines longer than the configured limit are
//! rejected instead of being buffered without bound.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default frame limit: a 100 MB upload base64-encodes to about 134 MB
pub const DEFAULT_MAX_FRAME_BYTES: usize = 160 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Reads frames off a buffered stream
pub struct FrameReader<R> {
    reader: R,
    line: String,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            line: String::new(),
            max_frame_bytes,
        }
    }

    /// Next non-empty line, without its terminator. `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<&str>, FrameError> {
        loop {
            self.line.clear();
            let limit = self.max_frame_bytes as u64 + 1;
            let read = (&mut self.reader).take(limit).read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            if read > self.max_frame_bytes && !self.line.ends_with('\n') {
                return Err(FrameError::TooLarge {
                    limit: self.max_frame_bytes,
                });
            }
            if !self.line.trim().is_empty() {
                return Ok(Some(self.line.trim()));
            }
        }
    }

    /// Next frame, decoded as `T`
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(line)?)),
            None => Ok(None),
        }
    }
}

/// Write one frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Best-effort request id of a frame that failed to decode
pub fn frame_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}
