//! Client session

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{new_shared_offset, ClockOffsetEstimate, ClockSyncEstimator, SharedClockOffset};
use crate::network::{self, ConnectionHandle};
use crate::output::AudioOutput;
use crate::scheduler::{PlaybackScheduler, ScheduleOutcome};
use crate::sync::{AudioPayload, CommandOutcome, StateUpdate};
use crate::time::{Clock, SystemClock};

use super::handlers::{run_event_loop, EventContext};
use super::types::{ClientConfig, CoreError, SessionCallback};

/// A connected listener/controller
pub struct Session<O: AudioOutput> {
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    connection: ConnectionHandle,
    scheduler: PlaybackScheduler<O>,
    offset: SharedClockOffset,
    callback: Arc<dyn SessionCallback>,
    event_task: JoinHandle<()>,
}

impl<O: AudioOutput> Session<O> {
    /// Connect using the system clock
    pub async fn connect(
        config: ClientConfig,
        output: Arc<O>,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Self, CoreError> {
        Self::connect_with_clock(config, output, callback, Arc::new(SystemClock)).await
    }

    /// Connect, sync the clock if configured, then start handling events.
    ///
    /// Events that arrive during the initial sync are queued and handled
    /// with the fresh offset.
    pub async fn connect_with_clock(
        config: ClientConfig,
        output: Arc<O>,
        callback: Arc<dyn SessionCallback>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        info!("Connecting to {}", config.server_addr);
        let (connection, events) = network::connect(&config.server_addr, &config.connection).await?;

        let scheduler = PlaybackScheduler::new(output, clock.clone());
        let offset = new_shared_offset();

        if config.sync_on_connect {
            let estimate = run_sync(&config, &clock, &connection, &offset).await;
            callback.on_clock_synced(estimate);
        }

        let ctx = EventContext {
            connection: connection.clone(),
            scheduler: scheduler.clone(),
            offset: offset.clone(),
            callback: callback.clone(),
        };
        let event_task = tokio::spawn(run_event_loop(ctx, events));

        Ok(Self {
            config,
            clock,
            connection,
            scheduler,
            offset,
            callback,
            event_task,
        })
    }

    /// Re-estimate the clock offset. Applies from the next state change on.
    pub async fn sync_clock(&self) -> ClockOffsetEstimate {
        let estimate = run_sync(&self.config, &self.clock, &self.connection, &self.offset).await;
        self.callback.on_clock_synced(estimate);
        estimate
    }

    /// Current offset estimate
    pub fn offset(&self) -> ClockOffsetEstimate {
        *self.offset.read()
    }

    /// Latest playback state seen from the server
    pub fn latest_state(&self) -> Option<StateUpdate> {
        self.scheduler.latest()
    }

    /// Estimated reference position right now, if a state has been seen
    pub fn position_ms(&self) -> Option<i64> {
        let update = self.latest_state()?;
        let reference_now = self.offset().to_reference(self.clock.now_ms()).round() as i64;
        Some(update.state.position_at(reference_now))
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    /// Start everyone after `delay_ms` (server default when `None`)
    pub async fn play(&self, delay_ms: Option<i64>) -> Result<CommandOutcome, CoreError> {
        self.log_outcome("play", self.connection.play(delay_ms).await)
    }

    pub async fn pause(&self) -> Result<CommandOutcome, CoreError> {
        self.log_outcome("pause", self.connection.pause().await)
    }

    pub async fn seek(&self, position_ms: i64) -> Result<CommandOutcome, CoreError> {
        self.log_outcome("seek", self.connection.seek(position_ms).await)
    }

    pub async fn stop(&self) -> Result<CommandOutcome, CoreError> {
        self.log_outcome("stop", self.connection.stop().await)
    }

    /// Share a new audio source with everyone
    pub async fn upload_audio(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<CommandOutcome, CoreError> {
        let payload = AudioPayload {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        };
        info!(
            "Uploading {} ({}, {} bytes)",
            payload.name,
            payload.mime_type,
            payload.bytes.len()
        );
        self.log_outcome("upload_audio", self.connection.upload_audio(payload).await)
    }

    /// Retry a playback start that the output refused to resume for.
    /// Call from a user gesture.
    pub fn resume_output(&self) -> Option<JoinHandle<ScheduleOutcome>> {
        self.scheduler.retry_resume()
    }

    /// Close the connection and stop playing
    pub async fn disconnect(self) {
        self.connection.close();
        if let Err(e) = self.event_task.await {
            warn!("Event loop ended abnormally: {}", e);
        }
    }

    fn log_outcome(
        &self,
        command: &str,
        result: Result<CommandOutcome, network::NetworkError>,
    ) -> Result<CommandOutcome, CoreError> {
        match &result {
            Ok(CommandOutcome::Applied(update)) => info!("{} applied (seq {})", command, update.seq),
            Ok(CommandOutcome::Unchanged) => info!("{} had no effect", command),
            Ok(CommandOutcome::NothingToControl) => info!("{} ignored: no audio loaded", command),
            Err(e) => warn!("{} failed: {}", command, e),
        }
        result.map_err(CoreError::from)
    }
}

async fn run_sync(
    config: &ClientConfig,
    clock: &Arc<dyn Clock>,
    connection: &ConnectionHandle,
    offset: &SharedClockOffset,
) -> ClockOffsetEstimate {
    let estimator = ClockSyncEstimator::with_config(clock.clone(), config.clock_sync.clone());
    let estimate = estimator.sync(connection).await;
    *offset.write() = estimate;
    estimate
}
