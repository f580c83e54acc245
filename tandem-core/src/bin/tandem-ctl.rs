//! Tandem - command line client
//!
//! Usage:
//!   tandem-ctl sync
//!   tandem-ctl play [delay_ms]
//!   tandem-ctl pause
//!   tandem-ctl seek <position_ms>
//!   tandem-ctl stop
//!   tandem-ctl upload <file> [mime_type]
//!   tandem-ctl watch
//!
//! The server is taken from `TANDEM_SERVER` (default 127.0.0.1:3000).

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tandem_core::clock::{ClockOffsetEstimate, ClockSyncEstimator};
use tandem_core::network::{self, ConnectionHandle};
use tandem_core::output::SilentOutput;
use tandem_core::session::{ClientConfig, Session, SessionCallback};
use tandem_core::sync::{AudioInfo, AudioPayload, CommandOutcome, PlaybackEventKind, StateUpdate};
use tandem_core::time::SystemClock;

const USAGE: &str = "usage: tandem-ctl <sync | play [delay_ms] | pause | seek <position_ms> | stop | upload <file> [mime_type] | watch>";

/// Duration the watch mode assumes for any audio, since it does not decode
const WATCH_ASSUMED_DURATION: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tandem_core::init_tracing("tandem_core=info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = ClientConfig::from_env();

    match args.first().map(String::as_str) {
        Some("sync") => sync(&config).await,
        Some("play") => {
            let delay_ms = match args.get(1) {
                Some(arg) => Some(parse_ms(arg)?),
                None => None,
            };
            let connection = open(&config).await?;
            report(connection.play(delay_ms).await?);
            Ok(())
        }
        Some("pause") => {
            report(open(&config).await?.pause().await?);
            Ok(())
        }
        Some("seek") => {
            let Some(arg) = args.get(1) else {
                return usage();
            };
            let position_ms = parse_ms(arg)?;
            report(open(&config).await?.seek(position_ms).await?);
            Ok(())
        }
        Some("stop") => {
            report(open(&config).await?.stop().await?);
            Ok(())
        }
        Some("upload") => {
            let Some(path) = args.get(1) else {
                return usage();
            };
            upload(&config, Path::new(path), args.get(2).cloned()).await
        }
        Some("watch") => watch(config).await,
        _ => usage(),
    }
}

fn usage() -> Result<(), Box<dyn Error>> {
    eprintln!("{}", USAGE);
    std::process::exit(2);
}

fn parse_ms(arg: &str) -> Result<i64, Box<dyn Error>> {
    arg.parse::<i64>()
        .map_err(|e| format!("invalid milliseconds {:?}: {}", arg, e).into())
}

async fn open(config: &ClientConfig) -> Result<ConnectionHandle, Box<dyn Error>> {
    let (connection, _events) = network::connect(&config.server_addr, &config.connection).await?;
    Ok(connection)
}

fn report(outcome: CommandOutcome) {
    match outcome {
        CommandOutcome::Applied(update) => println!(
            "applied: seq {} playing={} start_time={} elapsed={}ms",
            update.seq, update.state.is_playing, update.state.start_time, update.state.elapsed_ms
        ),
        CommandOutcome::Unchanged => println!("no change"),
        CommandOutcome::NothingToControl => println!("nothing to control: no audio loaded"),
    }
}

async fn sync(config: &ClientConfig) -> Result<(), Box<dyn Error>> {
    let connection = open(config).await?;
    let estimator = ClockSyncEstimator::with_config(SystemClock, config.clock_sync.clone());
    let estimate = estimator.sync(&connection).await;
    println!("{}", estimate);
    Ok(())
}

async fn upload(config: &ClientConfig, path: &Path, mime_type: Option<String>) -> Result<(), Box<dyn Error>> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    let mime_type = mime_type.unwrap_or_else(|| guess_mime_type(path).to_string());

    let connection = open(config).await?;
    report(
        connection
            .upload_audio(AudioPayload {
                name,
                mime_type,
                bytes,
            })
            .await?,
    );
    Ok(())
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" | "mp4" | "aac" => "audio/mp4",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Prints session events as they happen
struct PrintCallback;

impl SessionCallback for PrintCallback {
    fn on_playback_changed(&self, kind: PlaybackEventKind, update: StateUpdate) {
        println!(
            "{:?}: seq {} playing={} start_time={} elapsed={}ms",
            kind, update.seq, update.state.is_playing, update.state.start_time, update.state.elapsed_ms
        );
    }

    fn on_audio_available(&self, info: AudioInfo) {
        println!("audio available: {} ({})", info.name, info.mime_type);
    }

    fn on_audio_loaded(&self, info: AudioInfo, _duration: Duration) {
        println!("audio loaded: {}", info.name);
    }

    fn on_clock_synced(&self, estimate: ClockOffsetEstimate) {
        println!("clock synced: {}", estimate);
    }

    fn on_error(&self, message: String) {
        eprintln!("error: {}", message);
    }

    fn on_disconnected(&self) {
        println!("disconnected");
    }
}

async fn watch(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let output = Arc::new(SilentOutput::new(WATCH_ASSUMED_DURATION));
    let session = Session::connect(config, output, Arc::new(PrintCallback)).await?;

    tokio::signal::ctrl_c().await?;
    session.disconnect().await;
    Ok(())
}
