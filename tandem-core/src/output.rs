//! Audio output seam
//!
//! Decoding and sample output belong to the host platform. The scheduler only
//! needs to decode a payload into something with a duration, start it at a
//! given delay and buffer offset, and stop it again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

/// Errors reported by an audio output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Audio output resume rejected: {0}")]
    ResumeRejected(String),

    #[error("Audio output error: {0}")]
    Device(String),
}

/// A platform audio output (an audio context, a device stream, ...)
pub trait AudioOutput: Send + Sync + 'static {
    /// Decoded, playable audio
    type Buffer: Send + Sync + 'static;

    /// One scheduled or playing instance of a buffer
    type Voice: Send + 'static;

    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<Self::Buffer, OutputError>;

    fn buffer_duration(&self, buffer: &Self::Buffer) -> Duration;

    /// Whether the output is running (not suspended)
    fn is_running(&self) -> bool;

    /// Bring a suspended output back.
    ///
    /// Platforms that require a user gesture reject this until one happens.
    fn resume(&self) -> impl Future<Output = Result<(), OutputError>> + Send;

    /// Play `buffer` from `offset`, starting `delay` from now
    fn start(&self, buffer: &Self::Buffer, delay: Duration, offset: Duration) -> Result<Self::Voice, OutputError>;

    fn stop(&self, voice: Self::Voice) -> Result<(), OutputError>;
}

/// An output that plays nothing and logs what it would do.
///
/// It does not decode: every payload is taken to last `assumed_duration`.
#[derive(Debug)]
pub struct SilentOutput {
    assumed_duration: Duration,
    next_voice: AtomicU64,
}

impl SilentOutput {
    pub fn new(assumed_duration: Duration) -> Self {
        Self {
            assumed_duration,
            next_voice: AtomicU64::new(1),
        }
    }
}

impl AudioOutput for SilentOutput {
    type Buffer = usize;
    type Voice = u64;

    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<usize, OutputError> {
        if bytes.is_empty() {
            return Err(OutputError::Decode(format!("empty {} payload", mime_type)));
        }
        Ok(bytes.len())
    }

    fn buffer_duration(&self, _buffer: &usize) -> Duration {
        self.assumed_duration
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn resume(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn start(&self, buffer: &usize, delay: Duration, offset: Duration) -> Result<u64, OutputError> {
        let voice = self.next_voice.fetch_add(1, Ordering::Relaxed);
        info!(
            "[silent] voice {}: {} bytes in {:.3}s from {:.3}s",
            voice,
            buffer,
            delay.as_secs_f64(),
            offset.as_secs_f64()
        );
        Ok(voice)
    }

    fn stop(&self, voice: u64) -> Result<(), OutputError> {
        info!("[silent] voice {} stopped", voice);
        Ok(())
    }
}
