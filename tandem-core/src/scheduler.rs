//! Local playback scheduling
//!
//! Turns a broadcast playback state plus this client's clock offset into a
//! concrete "start in X seconds at buffer offset Y" on the audio output.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output::{AudioOutput, OutputError};
use crate::sync::{PlaybackState, StateUpdate};
use crate::time::Clock;

/// What a client should do with its output for a given state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulingDecision {
    /// Not playing: stop whatever is scheduled
    Cancel,
    /// Start the buffer at `buffer_offset`, `delay` from now
    Start { delay: Duration, buffer_offset: Duration },
    /// The start instant passed longer ago than the buffer lasts
    TooLate { behind: Duration },
}

/// Compute the local schedule for `state`.
///
/// `offset_ms` is the clock estimate (`reference ~= local + offset`),
/// `local_now_ms` the local clock.
pub fn decide(
    state: &PlaybackState,
    offset_ms: f64,
    local_now_ms: i64,
    buffer_duration: Duration,
) -> SchedulingDecision {
    if !state.is_playing {
        return SchedulingDecision::Cancel;
    }

    let start_local = state.start_time as f64 - offset_ms;
    let delay_secs = (start_local - local_now_ms as f64) / 1000.0;

    if delay_secs < 0.0 {
        let behind = -delay_secs;
        if behind > buffer_duration.as_secs_f64() {
            return SchedulingDecision::TooLate {
                behind: secs(behind),
            };
        }
        return SchedulingDecision::Start {
            delay: Duration::ZERO,
            buffer_offset: secs(behind),
        };
    }

    SchedulingDecision::Start {
        delay: secs(delay_secs),
        buffer_offset: Duration::ZERO,
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// What happened to a state update
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// A voice was started
    Started {
        seq: u64,
        delay: Duration,
        buffer_offset: Duration,
    },
    /// Not playing; any active voice was stopped
    Canceled,
    /// Start instant is already past the end of the buffer
    TooLate,
    /// Nothing decoded to play
    NoAudio,
    /// Older than an update already handled
    Stale,
    /// A newer update arrived while this one was waiting
    Superseded,
    /// Waiting for the output to resume; the task yields the final outcome
    AwaitingResume(JoinHandle<ScheduleOutcome>),
    /// Resume was rejected; call [`PlaybackScheduler::retry_resume`] on the next user gesture
    ResumeDeferred,
    /// The output refused to start
    Failed(OutputError),
}

struct SchedulerState<O: AudioOutput> {
    buffer: Option<Arc<O::Buffer>>,
    /// Active voice and the update that started it
    voice: Option<(u64, O::Voice)>,
    latest: Option<StateUpdate>,
    latest_offset_ms: f64,
    /// The latest update is waiting on a rejected resume
    deferred: bool,
}

/// Drives one audio output from playback state broadcasts.
///
/// At most one voice is active at a time, and work that had to wait for the
/// output to resume only goes ahead if no newer update arrived meanwhile.
pub struct PlaybackScheduler<O: AudioOutput> {
    output: Arc<O>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<SchedulerState<O>>>,
}

impl<O: AudioOutput> Clone for PlaybackScheduler<O> {
    fn clone(&self) -> Self {
        Self {
            output: Arc::clone(&self.output),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
        }
    }
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: Arc<O>, clock: Arc<dyn Clock>) -> Self {
        Self {
            output,
            clock,
            state: Arc::new(Mutex::new(SchedulerState {
                buffer: None,
                voice: None,
                latest: None,
                latest_offset_ms: 0.0,
                deferred: false,
            })),
        }
    }

    pub fn output(&self) -> &Arc<O> {
        &self.output
    }

    /// Decode and keep a new buffer, returning its duration.
    ///
    /// On failure the old buffer is dropped too, so nothing plays until a
    /// load succeeds.
    pub fn load(&self, bytes: &[u8], mime_type: &str) -> Result<Duration, OutputError> {
        let decoded = self.output.decode(bytes, mime_type);

        let mut st = self.state.lock();
        self.cancel_voice(&mut st);
        match decoded {
            Ok(buffer) => {
                let duration = self.output.buffer_duration(&buffer);
                st.buffer = Some(Arc::new(buffer));
                info!("Decoded audio, duration: {:.3}s", duration.as_secs_f64());
                Ok(duration)
            }
            Err(e) => {
                st.buffer = None;
                warn!("Audio decode failed: {}", e);
                Err(e)
            }
        }
    }

    /// Drop the buffer and stop playing
    pub fn unload(&self) {
        let mut st = self.state.lock();
        self.cancel_voice(&mut st);
        st.buffer = None;
    }

    pub fn has_audio(&self) -> bool {
        self.state.lock().buffer.is_some()
    }

    /// Whether a voice is scheduled or playing
    pub fn is_active(&self) -> bool {
        self.state.lock().voice.is_some()
    }

    /// Latest update handled
    pub fn latest(&self) -> Option<StateUpdate> {
        self.state.lock().latest
    }

    /// React to a new playback state from the reference side
    pub fn on_state_change(&self, update: StateUpdate, offset_ms: f64) -> ScheduleOutcome {
        let mut st = self.state.lock();

        if let Some(latest) = st.latest {
            if update.seq < latest.seq {
                debug!("Ignoring stale state seq {} (latest {})", update.seq, latest.seq);
                return ScheduleOutcome::Stale;
            }
        }

        st.latest = Some(update);
        st.latest_offset_ms = offset_ms;
        st.deferred = false;

        self.cancel_voice(&mut st);

        if !update.state.is_playing {
            return ScheduleOutcome::Canceled;
        }
        if st.buffer.is_none() {
            debug!("Cannot play seq {}: no buffer loaded", update.seq);
            return ScheduleOutcome::NoAudio;
        }

        if self.output.is_running() {
            return self.commit(&mut st, update.seq);
        }

        drop(st);
        ScheduleOutcome::AwaitingResume(self.spawn_resume(update.seq))
    }

    /// Run the latest update again with a fresh offset (after a new buffer
    /// loaded or the clock was resynced)
    pub fn reschedule(&self, offset_ms: f64) -> Option<ScheduleOutcome> {
        let latest = self.latest()?;
        Some(self.on_state_change(latest, offset_ms))
    }

    /// Retry a resume that was rejected. Call from a user gesture.
    pub fn retry_resume(&self) -> Option<JoinHandle<ScheduleOutcome>> {
        let seq = {
            let st = self.state.lock();
            if !st.deferred {
                return None;
            }
            st.latest?.seq
        };
        Some(self.spawn_resume(seq))
    }

    /// Stop any active voice
    pub fn stop(&self) {
        let mut st = self.state.lock();
        self.cancel_voice(&mut st);
    }

    fn spawn_resume(&self, seq: u64) -> JoinHandle<ScheduleOutcome> {
        let this = self.clone();
        tokio::spawn(async move {
            debug!("Resuming audio output before scheduling seq {}", seq);
            let resumed = this.output.resume().await;

            let mut st = this.state.lock();
            match resumed {
                Ok(()) => this.commit(&mut st, seq),
                Err(e) => {
                    if st.latest.map(|u| u.seq) != Some(seq) {
                        return ScheduleOutcome::Superseded;
                    }
                    warn!("{}; waiting for user interaction before playing", e);
                    st.deferred = true;
                    ScheduleOutcome::ResumeDeferred
                }
            }
        })
    }

    /// Start playback for update `seq`, if it is still the latest
    fn commit(&self, st: &mut SchedulerState<O>, seq: u64) -> ScheduleOutcome {
        let Some(update) = st.latest else {
            return ScheduleOutcome::Canceled;
        };
        if update.seq != seq {
            debug!("Dropping schedule for seq {}: superseded by {}", seq, update.seq);
            return ScheduleOutcome::Superseded;
        }
        st.deferred = false;

        let Some(buffer) = st.buffer.clone() else {
            return ScheduleOutcome::NoAudio;
        };
        let duration = self.output.buffer_duration(&buffer);

        match decide(&update.state, st.latest_offset_ms, self.clock.now_ms(), duration) {
            SchedulingDecision::Cancel => {
                self.cancel_voice(st);
                ScheduleOutcome::Canceled
            }
            SchedulingDecision::TooLate { behind } => {
                info!(
                    "Playback time is beyond buffer duration ({:.3}s behind, buffer {:.3}s)",
                    behind.as_secs_f64(),
                    duration.as_secs_f64()
                );
                ScheduleOutcome::TooLate
            }
            SchedulingDecision::Start { delay, buffer_offset } => {
                self.cancel_voice(st);
                info!(
                    "Scheduling start in {:.3}s at offset {:.3}s",
                    delay.as_secs_f64(),
                    buffer_offset.as_secs_f64()
                );
                match self.output.start(&buffer, delay, buffer_offset) {
                    Ok(voice) => {
                        st.voice = Some((seq, voice));
                        ScheduleOutcome::Started {
                            seq,
                            delay,
                            buffer_offset,
                        }
                    }
                    Err(e) => {
                        warn!("Failed to start playback: {}", e);
                        ScheduleOutcome::Failed(e)
                    }
                }
            }
        }
    }

    /// Stop the active voice. A failure here is ignored: whatever replaces
    /// the voice must not be blocked by it.
    fn cancel_voice(&self, st: &mut SchedulerState<O>) {
        if let Some((seq, voice)) = st.voice.take() {
            if let Err(e) = self.output.stop(voice) {
                debug!("Ignoring error stopping voice for seq {}: {}", seq, e);
            }
        }
    }
}
