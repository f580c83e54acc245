//! Server event handlers

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::SharedClockOffset;
use crate::network::ConnectionHandle;
use crate::output::AudioOutput;
use crate::scheduler::{PlaybackScheduler, ScheduleOutcome};
use crate::sync::{AudioInfo, AudioPayload, PlaybackEventKind, ServerEvent, StopReason};

use super::types::{CoreError, SessionCallback};

/// Everything the event loop needs
pub(super) struct EventContext<O: AudioOutput> {
    pub connection: ConnectionHandle,
    pub scheduler: PlaybackScheduler<O>,
    pub offset: SharedClockOffset,
    pub callback: Arc<dyn SessionCallback>,
}

/// Handle server events until the connection closes
pub(super) async fn run_event_loop<O: AudioOutput>(
    ctx: EventContext<O>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = events.recv().await {
        handle_server_event(&ctx, event).await;
    }

    ctx.scheduler.stop();
    info!("Disconnected from server");
    ctx.callback.on_disconnected();
}

/// Handle one server event
pub(super) async fn handle_server_event<O: AudioOutput>(ctx: &EventContext<O>, event: ServerEvent) {
    match event {
        ServerEvent::Playback { kind, update } => {
            debug!("Received {:?} (seq {}): {:?}", kind, update.seq, update.state);

            if kind == PlaybackEventKind::Stop(StopReason::SourceChanged) {
                ctx.scheduler.unload();
            }

            let offset_ms = ctx.offset.read().offset_ms;
            let outcome = ctx.scheduler.on_state_change(update, offset_ms);
            report_outcome(outcome, &ctx.callback);

            ctx.callback.on_playback_changed(kind, update);
        }

        ServerEvent::AudioAvailable(info) => {
            info!("Audio available: {} ({})", info.name, info.mime_type);
            ctx.callback.on_audio_available(info.clone());

            match ctx.connection.request_audio().await {
                Ok(Some(payload)) => load_audio(ctx, payload, info).await,
                Ok(None) => warn!("Server announced {} but has no audio to hand out", info.name),
                Err(e) => {
                    warn!("Failed to fetch audio: {}", e);
                    ctx.callback.on_error(CoreError::from(e).to_string());
                }
            }
        }
    }
}

/// Decode a fetched payload off the async threads, then catch up with the
/// latest state
async fn load_audio<O: AudioOutput>(ctx: &EventContext<O>, payload: Arc<AudioPayload>, info: AudioInfo) {
    let scheduler = ctx.scheduler.clone();
    let decoded =
        tokio::task::spawn_blocking(move || scheduler.load(&payload.bytes, &payload.mime_type)).await;

    match decoded {
        Ok(Ok(duration)) => {
            ctx.callback.on_audio_loaded(info, duration);
            let offset_ms = ctx.offset.read().offset_ms;
            if let Some(outcome) = ctx.scheduler.reschedule(offset_ms) {
                report_outcome(outcome, &ctx.callback);
            }
        }
        Ok(Err(e)) => ctx.callback.on_error(CoreError::from(e).to_string()),
        Err(e) => warn!("Decode task failed: {}", e),
    }
}

/// Surface scheduling problems to the callback
fn report_outcome(outcome: ScheduleOutcome, callback: &Arc<dyn SessionCallback>) {
    match outcome {
        ScheduleOutcome::AwaitingResume(pending) => {
            let callback = callback.clone();
            tokio::spawn(async move {
                match pending.await {
                    Ok(outcome) => report_outcome(outcome, &callback),
                    Err(e) => warn!("Resume task failed: {}", e),
                }
            });
        }
        ScheduleOutcome::ResumeDeferred => {
            callback.on_error("Audio output is suspended, interact to start playback".to_string());
        }
        ScheduleOutcome::Failed(e) => callback.on_error(CoreError::from(e).to_string()),
        other => debug!("Schedule outcome: {:?}", other),
    }
}
