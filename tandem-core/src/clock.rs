//! Clock offset estimation
//!
//! Estimates how far the local clock is from the reference clock using a
//! series of timestamped round-trip probes. One-way latency is taken as half
//! the round trip, so the fastest round trips (least queuing, least asymmetry)
//! give the most trustworthy samples.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::time::Clock;

/// Number of probes per sync run
const DEFAULT_ROUNDS: usize = 10;

/// How many of the lowest-RTT samples get averaged
const DEFAULT_BEST_SAMPLES: usize = 3;

/// Fewer usable samples than this means the estimate is a guess
const DEFAULT_MIN_SAMPLES: usize = 1;

/// How long a single probe may take before the round is dropped
const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(2);

/// Random pause between rounds, to avoid lining up with other periodic traffic
const DEFAULT_ROUND_DELAY_MIN: Duration = Duration::from_millis(50);
const DEFAULT_ROUND_DELAY_MAX: Duration = Duration::from_millis(100);

/// Clock sync tuning
#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    pub rounds: usize,
    pub best_samples: usize,
    pub min_samples: usize,
    pub round_timeout: Duration,
    pub round_delay_min: Duration,
    pub round_delay_max: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            best_samples: DEFAULT_BEST_SAMPLES,
            min_samples: DEFAULT_MIN_SAMPLES,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            round_delay_min: DEFAULT_ROUND_DELAY_MIN,
            round_delay_max: DEFAULT_ROUND_DELAY_MAX,
        }
    }
}

/// One probe result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub offset_ms: f64,
    pub round_trip_ms: f64,
}

impl ClockSample {
    /// Build a sample from a probe sent at local `t1`, answered with the
    /// reference clock reading `reference_now`, and received at local `t3`.
    pub fn from_exchange(t1: i64, reference_now: i64, t3: i64) -> Self {
        let round_trip_ms = (t3 - t1) as f64;
        let latency = round_trip_ms / 2.0;
        // Reference clock "now" at t3 is roughly its reading plus the return leg
        let offset_ms = (reference_now as f64 + latency) - t3 as f64;
        Self {
            offset_ms,
            round_trip_ms,
        }
    }
}

/// How much the estimate can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Averaged from real samples
    Measured,
    /// Not enough samples; offset assumed to be zero
    Low,
}

/// Result of a sync run: `reference_time ~= local_time + offset_ms`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffsetEstimate {
    pub offset_ms: f64,
    /// Fastest round trip seen, if any probe succeeded
    pub best_round_trip_ms: Option<f64>,
    /// Number of usable samples the run produced
    pub samples: usize,
    pub confidence: Confidence,
}

impl ClockOffsetEstimate {
    /// Before any sync has run, assume the clocks agree
    pub const UNSYNCED: ClockOffsetEstimate = ClockOffsetEstimate {
        offset_ms: 0.0,
        best_round_trip_ms: None,
        samples: 0,
        confidence: Confidence::Low,
    };

    pub fn is_low_confidence(&self) -> bool {
        self.confidence == Confidence::Low
    }

    /// Estimated reference clock reading at local time `local_ms`
    pub fn to_reference(&self, local_ms: i64) -> f64 {
        local_ms as f64 + self.offset_ms
    }

    /// Local time at which the reference clock reads `reference_ms`
    pub fn to_local(&self, reference_ms: i64) -> f64 {
        reference_ms as f64 - self.offset_ms
    }
}

impl Default for ClockOffsetEstimate {
    fn default() -> Self {
        Self::UNSYNCED
    }
}

impl fmt::Display for ClockOffsetEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.confidence, self.best_round_trip_ms) {
            (Confidence::Measured, Some(rtt)) => write!(
                f,
                "offset {:+.2}ms (best RTT {:.0}ms, {} samples)",
                self.offset_ms, rtt, self.samples
            ),
            _ => write!(f, "offset {:+.2}ms (low confidence)", self.offset_ms),
        }
    }
}

/// Reply to a time probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReply {
    /// Reference clock when the probe was answered
    pub reference_now: i64,
    /// The probe's send time, handed back unchanged
    pub echoed_send_time: i64,
}

/// Something that can carry a time probe to the reference side and back
pub trait TimeProbe: Send + Sync {
    type Error: fmt::Display + Send;

    fn probe(
        &self,
        client_send_time: i64,
    ) -> impl Future<Output = Result<TimeReply, Self::Error>> + Send;
}

/// Runs sync rounds against a [`TimeProbe`]
pub struct ClockSyncEstimator<C> {
    config: ClockSyncConfig,
    clock: C,
}

impl<C: Clock> ClockSyncEstimator<C> {
    pub fn new(clock: C) -> Self {
        Self::with_config(clock, ClockSyncConfig::default())
    }

    pub fn with_config(clock: C, config: ClockSyncConfig) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &ClockSyncConfig {
        &self.config
    }

    /// Probe the reference side `rounds` times, one after another, and
    /// estimate the offset from the best samples.
    pub async fn sync<P: TimeProbe>(&self, probe: &P) -> ClockOffsetEstimate {
        let rounds = self.config.rounds;
        let mut samples = Vec::with_capacity(rounds);

        for round in 0..rounds {
            if let Some(sample) = self.run_round(probe, round).await {
                samples.push(sample);
            }
            if round + 1 < rounds {
                tokio::time::sleep(self.round_delay()).await;
            }
        }

        let estimate = estimate_offset(samples, &self.config);
        if estimate.is_low_confidence() {
            warn!(
                "Time sync produced {} usable samples out of {}, assuming clocks are aligned",
                estimate.samples, rounds
            );
        } else {
            info!("Time synced: {}", estimate);
        }
        estimate
    }

    async fn run_round<P: TimeProbe>(&self, probe: &P, round: usize) -> Option<ClockSample> {
        let t1 = self.clock.now_ms();

        let reply = match tokio::time::timeout(self.config.round_timeout, probe.probe(t1)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!("Time sync round {} failed: {}", round, e);
                return None;
            }
            Err(_) => {
                debug!(
                    "Time sync round {} timed out after {:?}",
                    round, self.config.round_timeout
                );
                return None;
            }
        };

        let t3 = self.clock.now_ms();

        if reply.echoed_send_time != t1 {
            debug!(
                "Time sync round {}: reply echoes {} but probe was sent at {}, dropping",
                round, reply.echoed_send_time, t1
            );
            return None;
        }

        let sample = ClockSample::from_exchange(t1, reply.reference_now, t3);
        debug!(
            "Time sync round {}: RTT={}ms, offset={:.1}ms",
            round, sample.round_trip_ms, sample.offset_ms
        );
        Some(sample)
    }

    fn round_delay(&self) -> Duration {
        let min = self.config.round_delay_min;
        let max = self.config.round_delay_max;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Average the offsets of the lowest-RTT samples.
///
/// High-RTT samples carry the most latency asymmetry, so they are discarded
/// rather than averaged in.
pub fn estimate_offset(mut samples: Vec<ClockSample>, config: &ClockSyncConfig) -> ClockOffsetEstimate {
    let usable = samples.len();
    if usable == 0 || usable < config.min_samples {
        return ClockOffsetEstimate {
            samples: usable,
            ..ClockOffsetEstimate::UNSYNCED
        };
    }

    samples.sort_by(|a, b| a.round_trip_ms.total_cmp(&b.round_trip_ms));

    let best = &samples[..config.best_samples.clamp(1, usable)];
    let offset_ms = best.iter().map(|s| s.offset_ms).sum::<f64>() / best.len() as f64;

    ClockOffsetEstimate {
        offset_ms,
        best_round_trip_ms: Some(best[0].round_trip_ms),
        samples: usable,
        confidence: Confidence::Measured,
    }
}

/// The client's current estimate, written by sync runs and read by the scheduler
pub type SharedClockOffset = Arc<RwLock<ClockOffsetEstimate>>;

/// Create a new shared offset, initially unsynced
pub fn new_shared_offset() -> SharedClockOffset {
    Arc::new(RwLock::new(ClockOffsetEstimate::UNSYNCED))
}
