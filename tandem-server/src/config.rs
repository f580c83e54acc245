//! Server configuration

use tandem_core::network::DEFAULT_MAX_FRAME_BYTES;
use tandem_core::sync::DEFAULT_PLAY_DELAY_MS;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on
    pub bind: String,
    pub port: u16,
    /// Largest accepted frame, in bytes
    pub max_frame_bytes: usize,
    /// Delay applied to `play` requests that do not name one
    pub default_play_delay_ms: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            default_play_delay_ms: DEFAULT_PLAY_DELAY_MS,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND` and `TANDEM_PORT`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("TANDEM_BIND") {
            config.bind = bind;
        }
        if let Some(port) = std::env::var("TANDEM_PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
