//! Metrics tracking for the tandem server

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::net::SocketAddr;

use tandem_core::sync::{ClientId, CommandOutcome, StoreSnapshot};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Playback,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Playback => "PLAY",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address we are listening on
    pub listen_addr: Option<String>,

    /// Current number of connected clients
    pub connected_clients: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Control commands that changed the state
    pub commands_applied: u64,

    /// Control commands that had no effect
    pub commands_ignored: u64,

    /// Clock probes answered
    pub probes_answered: u64,

    /// Audio uploads accepted
    pub uploads: u64,

    /// Latest view of the playback store
    pub playback: Option<StoreSnapshot>,

    /// Connected clients (for display)
    pub client_list: Vec<ClientInfo>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Local>,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            listen_addr: None,
            connected_clients: 0,
            total_connections: 0,
            peak_connections: 0,
            commands_applied: 0,
            commands_ignored: 0,
            probes_answered: 0,
            uploads: 0,
            playback: None,
            client_list: Vec::new(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a new connection
    pub fn connection_established(&mut self, client_id: ClientId, addr: SocketAddr) {
        self.connected_clients += 1;
        self.total_connections += 1;
        if self.connected_clients > self.peak_connections {
            self.peak_connections = self.connected_clients;
        }

        self.client_list.push(ClientInfo {
            client_id,
            addr,
            connected_at: Local::now(),
        });
        self.log(LogLevel::Connection, format!("Connected: #{} ({})", client_id, addr));
    }

    /// Record a disconnection (only if the client was tracked)
    pub fn connection_closed(&mut self, client_id: ClientId) {
        let Some(index) = self.client_list.iter().position(|c| c.client_id == client_id) else {
            return;
        };
        let client = self.client_list.remove(index);
        self.connected_clients = self.connected_clients.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: #{} ({})", client_id, client.addr));
    }

    /// Record the outcome of a control command
    pub fn command_handled(&mut self, client_id: ClientId, command: &str, outcome: &CommandOutcome) {
        match outcome {
            CommandOutcome::Applied(update) => {
                self.commands_applied += 1;
                self.log(
                    LogLevel::Playback,
                    format!("#{} {} -> seq {}", client_id, command, update.seq),
                );
            }
            CommandOutcome::Unchanged => self.commands_ignored += 1,
            CommandOutcome::NothingToControl => {
                self.commands_ignored += 1;
                self.log(
                    LogLevel::Warning,
                    format!("#{} {} ignored: no audio loaded", client_id, command),
                );
            }
        }
    }

    pub fn probe_answered(&mut self) {
        self.probes_answered += 1;
    }

    pub fn upload_received(&mut self, client_id: ClientId, name: &str, bytes: usize) {
        self.uploads += 1;
        self.log(
            LogLevel::Playback,
            format!("#{} uploaded {} ({} bytes)", client_id, name, bytes),
        );
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::sync::{PlaybackState, StateUpdate};

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_connection_counts_and_peak() {
        let mut m = Metrics::new();
        m.connection_established(1, addr());
        m.connection_established(2, addr());
        m.connection_closed(1);
        m.connection_closed(1);
        m.connection_established(3, addr());

        assert_eq!(m.connected_clients, 2);
        assert_eq!(m.total_connections, 3);
        assert_eq!(m.peak_connections, 2);
        assert_eq!(m.client_list.len(), 2);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut m = Metrics::new();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            m.log(LogLevel::Info, format!("entry {}", i));
        }
        assert_eq!(m.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(m.logs.front().map(|e| e.message.as_str()), Some("entry 5"));
    }

    #[test]
    fn test_command_outcomes_are_counted() {
        let mut m = Metrics::new();
        let update = StateUpdate {
            seq: 1,
            state: PlaybackState::STOPPED,
        };
        m.command_handled(1, "play", &CommandOutcome::Applied(update));
        m.command_handled(1, "pause", &CommandOutcome::Unchanged);
        m.command_handled(1, "seek", &CommandOutcome::NothingToControl);

        assert_eq!(m.commands_applied, 1);
        assert_eq!(m.commands_ignored, 2);
    }
}
