//! Tandem - Reference Server
//!
//! Owns the reference clock, the playback state and the shared audio source,
//! with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Environment: `TANDEM_BIND` (default 0.0.0.0), `TANDEM_PORT` (default 3000).

mod config;
mod dashboard;
mod metrics;
mod network;

use std::sync::Arc;
use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    let config = config::ServerConfig::from_env();

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(config, metrics).await
    } else {
        // Run with plain logging
        network::run_with_logging(config, metrics).await
    }
}
