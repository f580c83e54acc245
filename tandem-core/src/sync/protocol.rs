//! Sync Protocol Messages

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::state::PlaybackState;

/// Play delay used when a client does not ask for one
pub const DEFAULT_PLAY_DELAY_MS: i64 = 2000;

/// Announcement of a loaded audio source (no bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    /// File name as uploaded
    pub name: String,
    /// MIME type as uploaded
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// A full audio source, as uploaded and as handed out on request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Raw encoded audio, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl AudioPayload {
    pub fn info(&self) -> AudioInfo {
        AudioInfo {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

impl fmt::Debug for AudioPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPayload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// A playback state tagged with its broadcast sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Increases by one for every applied transition
    pub seq: u64,
    pub state: PlaybackState,
}

/// Why everyone was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Someone issued `stop`
    Command,
    /// A new audio source replaced the old one
    SourceChanged,
}

/// Playback control commands, applied by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Play { delay_ms: i64 },
    Pause,
    Seek { position_ms: i64 },
    Stop,
}

/// Result of applying a command to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The state changed and was broadcast
    Applied(StateUpdate),
    /// The command had no effect (e.g. pause while paused)
    Unchanged,
    /// No audio source is loaded
    NothingToControl,
}

/// Messages a client sends to the reference side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Round-trip probe for clock sync
    #[serde(rename = "timesync")]
    TimeSync { client_send_time: i64 },

    /// Start or resume playback after a delay
    Play {
        #[serde(default)]
        delay_ms: Option<i64>,
    },

    /// Pause playback
    Pause,

    /// Seek to position
    Seek { position_ms: i64 },

    /// Stop and rewind
    Stop,

    /// Replace the shared audio source
    UploadAudio(AudioPayload),

    /// Fetch the shared audio source
    RequestAudio,
}

impl ClientMessage {
    /// Convert to a store command, if this is a playback control message
    pub fn as_control(&self) -> Option<ControlCommand> {
        self.as_control_with_delay(DEFAULT_PLAY_DELAY_MS)
    }

    /// Like [`as_control`](Self::as_control), with a different default play delay
    pub fn as_control_with_delay(&self, default_delay_ms: i64) -> Option<ControlCommand> {
        match self {
            ClientMessage::Play { delay_ms } => Some(ControlCommand::Play {
                delay_ms: delay_ms.unwrap_or(default_delay_ms),
            }),
            ClientMessage::Pause => Some(ControlCommand::Pause),
            ClientMessage::Seek { position_ms } => Some(ControlCommand::Seek {
                position_ms: *position_ms,
            }),
            ClientMessage::Stop => Some(ControlCommand::Stop),
            _ => None,
        }
    }

    /// Short event name for logs
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::TimeSync { .. } => "timesync",
            ClientMessage::Play { .. } => "play",
            ClientMessage::Pause => "pause",
            ClientMessage::Seek { .. } => "seek",
            ClientMessage::Stop => "stop",
            ClientMessage::UploadAudio(_) => "upload_audio",
            ClientMessage::RequestAudio => "request_audio",
        }
    }
}

/// A client message with the id its acknowledgement will carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub message: ClientMessage,
}

/// Acknowledgement payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    #[serde(rename = "timesync")]
    TimeSync {
        reference_now: i64,
        echoed_send_time: i64,
    },
    Command(CommandOutcome),
    Audio(Option<Arc<AudioPayload>>),
    Error { message: String },
}

/// Messages the reference side sends to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of a request
    Reply { id: u64, reply: Reply },

    /// Current state, sent on connect
    PlaybackState(StateUpdate),

    /// Broadcast after `play`
    Play(StateUpdate),

    /// Broadcast after `pause`
    Pause(StateUpdate),

    /// Broadcast after `seek`
    Seek(StateUpdate),

    /// Broadcast after `stop` or a source change
    Stop {
        update: StateUpdate,
        reason: StopReason,
    },

    /// A source is loaded and can be requested
    AudioAvailable(AudioInfo),
}

impl ServerMessage {
    /// The playback state carried by this message, if any
    pub fn state_update(&self) -> Option<StateUpdate> {
        match self {
            ServerMessage::PlaybackState(update)
            | ServerMessage::Play(update)
            | ServerMessage::Pause(update)
            | ServerMessage::Seek(update)
            | ServerMessage::Stop { update, .. } => Some(*update),
            _ => None,
        }
    }
}

/// Events pushed to a client (everything except replies)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Playback {
        kind: PlaybackEventKind,
        update: StateUpdate,
    },
    AudioAvailable(AudioInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEventKind {
    Snapshot,
    Play,
    Pause,
    Seek,
    Stop(StopReason),
}

impl ServerEvent {
    /// Split a server message into an event, or give back the reply
    pub fn from_message(message: ServerMessage) -> Result<Self, (u64, Reply)> {
        let (kind, update) = match message {
            ServerMessage::Reply { id, reply } => return Err((id, reply)),
            ServerMessage::AudioAvailable(info) => return Ok(ServerEvent::AudioAvailable(info)),
            ServerMessage::PlaybackState(update) => (PlaybackEventKind::Snapshot, update),
            ServerMessage::Play(update) => (PlaybackEventKind::Play, update),
            ServerMessage::Pause(update) => (PlaybackEventKind::Pause, update),
            ServerMessage::Seek(update) => (PlaybackEventKind::Seek, update),
            ServerMessage::Stop { update, reason } => (PlaybackEventKind::Stop(reason), update),
        };
        Ok(ServerEvent::Playback { kind, update })
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_on_the_wire() {
        let json = serde_json::to_string(&ClientMessage::TimeSync { client_send_time: 7 }).unwrap();
        assert_eq!(json, r#"{"timesync":{"client_send_time":7}}"#);

        let json = serde_json::to_string(&ClientMessage::Pause).unwrap();
        assert_eq!(json, r#""pause""#);

        let json = serde_json::to_string(&ServerMessage::AudioAvailable(AudioInfo {
            name: "a.mp3".into(),
            mime_type: "audio/mpeg".into(),
        }))
        .unwrap();
        assert_eq!(json, r#"{"audio_available":{"name":"a.mp3","type":"audio/mpeg"}}"#);
    }

    #[test]
    fn test_play_delay_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"play":{}}"#).unwrap();
        assert_eq!(
            msg.as_control(),
            Some(ControlCommand::Play { delay_ms: DEFAULT_PLAY_DELAY_MS })
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"play":{"delay_ms":500}}"#).unwrap();
        assert_eq!(msg.as_control(), Some(ControlCommand::Play { delay_ms: 500 }));

        assert_eq!(ClientMessage::RequestAudio.as_control(), None);
    }

    #[test]
    fn test_audio_bytes_are_base64() {
        let payload = AudioPayload {
            name: "tone.wav".into(),
            mime_type: "audio/wav".into(),
            bytes: vec![0, 1, 2, 254, 255],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["bytes"], "AAEC/v8=");

        let back: AudioPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_replies_split_from_events() {
        let update = StateUpdate {
            seq: 3,
            state: PlaybackState::default(),
        };
        let event = ServerEvent::from_message(ServerMessage::Stop {
            update,
            reason: StopReason::SourceChanged,
        })
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::Playback {
                kind: PlaybackEventKind::Stop(StopReason::SourceChanged),
                update
            }
        );

        let reply = ServerEvent::from_message(ServerMessage::Reply {
            id: 9,
            reply: Reply::Command(CommandOutcome::NothingToControl),
        });
        assert!(matches!(reply, Err((9, Reply::Command(CommandOutcome::NothingToControl)))));
    }
}
