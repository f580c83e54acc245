//! Tandem - Core Library
//!
//! Synchronized playback of one audio source across many clients: clock
//! offset estimation against a reference clock, the authoritative playback
//! state machine, and per-client playback scheduling.

pub mod clock;
pub mod network;
pub mod output;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod time;

use std::sync::Once;

// Re-exports for convenience
pub use clock::{ClockOffsetEstimate, ClockSyncConfig, ClockSyncEstimator, Confidence, TimeProbe};
pub use output::{AudioOutput, OutputError};
pub use scheduler::{PlaybackScheduler, ScheduleOutcome, SchedulingDecision};
pub use session::{ClientConfig, CoreError, Session, SessionCallback};
pub use sync::{PlaybackState, PlaybackStore, StateUpdate, StoreHandle};

static TRACING_INIT: Once = Once::new();

/// Initialize logging once per process.
///
/// `default_directives` is a comma-separated `EnvFilter` directive list used
/// when `RUST_LOG` is not set.
pub fn init_tracing(default_directives: &str) {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}
