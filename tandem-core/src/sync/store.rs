//! Authoritative playback store
//!
//! A single task owns the playback state, the loaded audio source and the set
//! of connected clients. Commands are queued and applied one at a time, and
//! each resulting broadcast is fanned out before the next command is looked at,
//! so every client observes the same transitions in the same order.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::time::Clock;

use super::protocol::{
    AudioInfo, AudioPayload, CommandOutcome, ControlCommand, ServerMessage, StateUpdate, StopReason,
};
use super::state::PlaybackState;

/// Connection identifier assigned by the server
pub type ClientId = u64;

/// Outgoing message queue of one client
pub type ClientSink = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Playback store is not running")]
    Closed,
}

/// Point-in-time view of the store
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub update: StateUpdate,
    pub source: Option<AudioInfo>,
    pub source_bytes: usize,
    pub clients: usize,
}

/// Commands sent to the store task
enum StoreCommand {
    Control {
        command: ControlCommand,
        reply: oneshot::Sender<CommandOutcome>,
    },
    LoadSource {
        payload: AudioPayload,
        reply: oneshot::Sender<StateUpdate>,
    },
    RequestAudio {
        reply: oneshot::Sender<Option<Arc<AudioPayload>>>,
    },
    Register {
        client_id: ClientId,
        sink: ClientSink,
    },
    Unregister {
        client_id: ClientId,
    },
    Snapshot {
        reply: oneshot::Sender<StoreSnapshot>,
    },
    Shutdown,
}

/// Handle to communicate with the running store
#[derive(Clone)]
pub struct StoreHandle {
    command_tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    /// Apply a playback command and wait for its outcome
    pub async fn control(&self, command: ControlCommand) -> Result<CommandOutcome, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Control { command, reply })?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Replace the audio source. Resets playback for everyone.
    pub async fn load_source(&self, payload: AudioPayload) -> Result<StateUpdate, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::LoadSource { payload, reply })?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// The loaded source, if any
    pub async fn request_audio(&self) -> Result<Option<Arc<AudioPayload>>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::RequestAudio { reply })?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Start delivering broadcasts to `sink`.
    ///
    /// The sink first receives the current state (and the source announcement
    /// when one is loaded), then every later broadcast.
    pub fn register(&self, client_id: ClientId, sink: ClientSink) -> Result<(), StoreError> {
        self.send(StoreCommand::Register { client_id, sink })
    }

    pub fn unregister(&self, client_id: ClientId) {
        let _ = self.send(StoreCommand::Unregister { client_id });
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Snapshot { reply })?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(StoreCommand::Shutdown);
    }

    fn send(&self, command: StoreCommand) -> Result<(), StoreError> {
        self.command_tx.send(command).map_err(|_| StoreError::Closed)
    }
}

/// The single writer of [`PlaybackState`]
pub struct PlaybackStore {
    clock: Arc<dyn Clock>,
    state: PlaybackState,
    seq: u64,
    source: Option<Arc<AudioPayload>>,
    clients: HashMap<ClientId, ClientSink>,
}

impl PlaybackStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: PlaybackState::STOPPED,
            seq: 0,
            source: None,
            clients: HashMap::new(),
        }
    }

    /// Move the store onto its own task and return a handle to it
    pub fn spawn(self) -> StoreHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(command_rx));
        StoreHandle { command_tx }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<StoreCommand>) {
        debug!("Playback store started");
        while let Some(command) = command_rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        debug!("Playback store stopped");
    }

    /// Process one command. Returns false on shutdown.
    fn handle(&mut self, command: StoreCommand) -> bool {
        match command {
            StoreCommand::Control { command, reply } => {
                let outcome = self.apply(command);
                let _ = reply.send(outcome);
            }
            StoreCommand::LoadSource { payload, reply } => {
                let update = self.load(payload);
                let _ = reply.send(update);
            }
            StoreCommand::RequestAudio { reply } => {
                let _ = reply.send(self.source.clone());
            }
            StoreCommand::Register { client_id, sink } => self.register(client_id, sink),
            StoreCommand::Unregister { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    debug!("Client {} unregistered ({} left)", client_id, self.clients.len());
                }
            }
            StoreCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            StoreCommand::Shutdown => return false,
        }
        true
    }

    /// Current state and its sequence number
    pub fn current(&self) -> StateUpdate {
        StateUpdate {
            seq: self.seq,
            state: self.state,
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            update: self.current(),
            source: self.source.as_ref().map(|s| s.info()),
            source_bytes: self.source.as_ref().map(|s| s.bytes.len()).unwrap_or(0),
            clients: self.clients.len(),
        }
    }

    /// Apply a control command and broadcast the resulting state
    pub fn apply(&mut self, command: ControlCommand) -> CommandOutcome {
        if self.source.is_none() {
            debug!("Ignoring {:?}: no audio source loaded", command);
            return CommandOutcome::NothingToControl;
        }

        let now = self.clock.now_ms();
        let next = match command {
            ControlCommand::Play { delay_ms } => Some(self.state.play(now, delay_ms)),
            ControlCommand::Pause => self.state.pause(now),
            ControlCommand::Seek { position_ms } => Some(self.state.seek(now, position_ms)),
            ControlCommand::Stop => Some(self.state.stop()),
        };

        let Some(next) = next else {
            return CommandOutcome::Unchanged;
        };

        let update = self.commit(next);
        match command {
            ControlCommand::Play { delay_ms } => {
                info!(
                    "Starting playback. Reference time: {}, scheduled start: {}, resuming from: {}ms (delay {}ms)",
                    now, next.start_time, next.elapsed_ms, delay_ms
                );
                self.broadcast(ServerMessage::Play(update));
            }
            ControlCommand::Pause => {
                info!("Paused at elapsed: {}ms", next.elapsed_ms);
                self.broadcast(ServerMessage::Pause(update));
            }
            ControlCommand::Seek { position_ms } => {
                info!("Seeking to: {}ms (playing: {})", position_ms, next.is_playing);
                self.broadcast(ServerMessage::Seek(update));
            }
            ControlCommand::Stop => {
                info!("Stopped");
                self.broadcast(ServerMessage::Stop {
                    update,
                    reason: StopReason::Command,
                });
            }
        }
        CommandOutcome::Applied(update)
    }

    /// Replace the audio source and reset playback
    pub fn load(&mut self, payload: AudioPayload) -> StateUpdate {
        info!(
            "Received audio: {} ({}), size: {} bytes",
            payload.name,
            payload.mime_type,
            payload.bytes.len()
        );
        let info = payload.info();
        self.source = Some(Arc::new(payload));

        let update = self.commit(PlaybackState::STOPPED);
        self.broadcast(ServerMessage::Stop {
            update,
            reason: StopReason::SourceChanged,
        });
        self.broadcast(ServerMessage::AudioAvailable(info));
        update
    }

    /// Add a client and bring it up to date
    pub fn register(&mut self, client_id: ClientId, sink: ClientSink) {
        let mut delivered = sink.send(ServerMessage::PlaybackState(self.current())).is_ok();
        if let Some(source) = &self.source {
            delivered &= sink.send(ServerMessage::AudioAvailable(source.info())).is_ok();
        }

        if delivered {
            self.clients.insert(client_id, sink);
            debug!("Client {} registered ({} total)", client_id, self.clients.len());
        } else {
            debug!("Client {} went away before registering", client_id);
        }
    }

    fn commit(&mut self, state: PlaybackState) -> StateUpdate {
        self.state = state;
        self.seq += 1;
        self.current()
    }

    /// Send to every client, dropping the ones that have gone away
    fn broadcast(&mut self, message: ServerMessage) {
        self.clients.retain(|client_id, sink| {
            let alive = sink.send(message.clone()).is_ok();
            if !alive {
                debug!("Dropping closed client {}", client_id);
            }
            alive
        });
    }
}
