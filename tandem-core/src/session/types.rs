//! Session-facing types

use std::time::Duration;

use crate::clock::{ClockOffsetEstimate, ClockSyncConfig};
use crate::network::{ConnectionConfig, NetworkError};
use crate::output::OutputError;
use crate::sync::{AudioInfo, PlaybackEventKind, StateUpdate};

/// Server used when `TANDEM_SERVER` is not set
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:3000";

/// Error types exposed to session users
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Audio output error: {0}")]
    Output(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Timeout(_) => CoreError::Timeout,
            NetworkError::Rejected(message) => CoreError::Rejected(message),
            other => CoreError::Network(other.to_string()),
        }
    }
}

impl From<OutputError> for CoreError {
    fn from(e: OutputError) -> Self {
        match e {
            OutputError::Decode(message) => CoreError::Decode(message),
            other => CoreError::Output(other.to_string()),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub server_addr: String,
    pub connection: ConnectionConfig,
    /// Run a clock sync before handling any server events
    pub sync_on_connect: bool,
    pub clock_sync: ClockSyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            connection: ConnectionConfig::default(),
            sync_on_connect: true,
            clock_sync: ClockSyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults, with the server address taken from `TANDEM_SERVER` if set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TANDEM_SERVER") {
            if !addr.trim().is_empty() {
                config.server_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Callback interface for session events
pub trait SessionCallback: Send + Sync {
    fn on_playback_changed(&self, kind: PlaybackEventKind, update: StateUpdate);
    fn on_audio_available(&self, info: AudioInfo);
    /// The announced audio was fetched and decoded
    fn on_audio_loaded(&self, info: AudioInfo, duration: Duration);
    fn on_clock_synced(&self, estimate: ClockOffsetEstimate);
    fn on_error(&self, message: String);
    fn on_disconnected(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_map_to_core_errors() {
        let err: CoreError = NetworkError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, CoreError::Timeout));

        let err: CoreError = NetworkError::Rejected("no".into()).into();
        assert!(matches!(err, CoreError::Rejected(m) if m == "no"));

        let err: CoreError = NetworkError::Closed.into();
        assert!(matches!(err, CoreError::Network(m) if m == "Connection closed"));
    }

    #[test]
    fn test_decode_errors_stay_decode_errors() {
        let err: CoreError = OutputError::Decode("bad header".into()).into();
        assert!(matches!(err, CoreError::Decode(m) if m == "bad header"));

        let err: CoreError = OutputError::Device("gone".into()).into();
        assert!(matches!(err, CoreError::Output(_)));
    }
}
