//! Network handling for the tandem server

use crate::config::ServerConfig;
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use parking_lot::RwLock;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::network::{frame_id, write_frame, FrameReader};
use tandem_core::sync::{
    ClientId, ClientMessage, CommandOutcome, PlaybackStore, Reply, Request, ServerMessage, StoreHandle,
};
use tandem_core::time::{Clock, SystemClock};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often the dashboard's view of the store is refreshed
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(250);

/// Shared by every connection
#[derive(Clone)]
pub struct ServerContext {
    pub store: StoreHandle,
    pub metrics: Arc<RwLock<Metrics>>,
    pub clock: Arc<dyn Clock>,
    pub max_frame_bytes: usize,
    pub default_play_delay_ms: i64,
}

impl ServerContext {
    /// Start a playback store on the system clock
    pub fn new(config: &ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store: PlaybackStore::new(clock.clone()).spawn(),
            metrics,
            clock,
            max_frame_bytes: config.max_frame_bytes,
            default_play_delay_ms: config.default_play_delay_ms,
        }
    }
}

/// Bind, then serve until the listener fails
pub async fn run(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    info!("Tandem server starting...");

    let listen_addr = config.listen_addr();
    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Failed to bind {}: {}", listen_addr, e));
            return Err(e.into());
        }
    };
    let local_addr = listener.local_addr()?;
    info!("Listening on {}", local_addr);

    {
        let mut m = metrics.write();
        m.listen_addr = Some(local_addr.to_string());
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on {}", local_addr));
    }

    let ctx = ServerContext::new(&config, metrics);
    serve(listener, ctx).await;
    Ok(())
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandem_server=info".parse()?)
                .add_directive("tandem_core=info".parse()?),
        )
        .init();

    run(config, metrics).await
}

/// Accept connections and keep the metrics' playback view fresh
pub async fn serve(listener: TcpListener, ctx: ServerContext) {
    let mut next_client_id: ClientId = 1;
    let mut snapshot_tick = tokio::time::interval(SNAPSHOT_INTERVAL);

    loop {
        tokio::select! {
            _ = snapshot_tick.tick() => {
                if let Ok(snapshot) = ctx.store.snapshot().await {
                    ctx.metrics.write().playback = Some(snapshot);
                }
            }

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        ctx.metrics.write().log(LogLevel::Warning, format!("Accept failed: {}", e));
                        continue;
                    }
                };
                let client_id = next_client_id;
                next_client_id += 1;
                tokio::spawn(handle_connection(stream, addr, client_id, ctx.clone()));
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, client_id: ClientId, ctx: ServerContext) {
    info!("Client #{} connected from {}", client_id, addr);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for #{}: {}", client_id, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (sink, outgoing) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, outgoing, client_id));

    // Current state (and source announcement) go out before anything else
    if ctx.store.register(client_id, sink.clone()).is_err() {
        warn!("Playback store is gone, dropping client #{}", client_id);
        return;
    }
    ctx.metrics.write().connection_established(client_id, addr);

    let mut reader = FrameReader::new(BufReader::new(read_half), ctx.max_frame_bytes);
    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Closing client #{}: {}", client_id, e);
                ctx.metrics
                    .write()
                    .log(LogLevel::Warning, format!("#{} dropped: {}", client_id, e));
                break;
            }
        };

        let message = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let reply = handle_request(&ctx, client_id, request.message).await;
                ServerMessage::Reply { id: request.id, reply }
            }
            Err(e) => {
                warn!("Malformed frame from client #{}: {}", client_id, e);
                match frame_id(line) {
                    Some(id) => ServerMessage::Reply {
                        id,
                        reply: Reply::Error {
                            message: format!("Malformed request: {}", e),
                        },
                    },
                    None => continue,
                }
            }
        };

        if sink.send(message).is_err() {
            break;
        }
    }

    ctx.store.unregister(client_id);
    drop(sink);
    // Finishes once the store has dropped its copy of the sink
    let _ = writer.await;

    info!("Client #{} disconnected", client_id);
    ctx.metrics.write().connection_closed(client_id);
}

/// Answer one request
async fn handle_request(ctx: &ServerContext, client_id: ClientId, message: ClientMessage) -> Reply {
    match message {
        ClientMessage::TimeSync { client_send_time } => {
            let reference_now = ctx.clock.now_ms();
            ctx.metrics.write().probe_answered();
            Reply::TimeSync {
                reference_now,
                echoed_send_time: client_send_time,
            }
        }

        ClientMessage::UploadAudio(payload) => {
            let name = payload.name.clone();
            let size = payload.bytes.len();
            match ctx.store.load_source(payload).await {
                Ok(update) => {
                    ctx.metrics.write().upload_received(client_id, &name, size);
                    Reply::Command(CommandOutcome::Applied(update))
                }
                Err(e) => Reply::Error { message: e.to_string() },
            }
        }

        ClientMessage::RequestAudio => match ctx.store.request_audio().await {
            Ok(audio) => {
                debug!("Client #{} requested audio ({})", client_id, audio.is_some());
                Reply::Audio(audio)
            }
            Err(e) => Reply::Error { message: e.to_string() },
        },

        control => {
            let name = control.event_name();
            let Some(command) = control.as_control_with_delay(ctx.default_play_delay_ms) else {
                return Reply::Error {
                    message: format!("Unsupported request: {}", name),
                };
            };
            match ctx.store.control(command).await {
                Ok(outcome) => {
                    ctx.metrics.write().command_handled(client_id, name, &outcome);
                    Reply::Command(outcome)
                }
                Err(e) => Reply::Error { message: e.to_string() },
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<ServerMessage>, client_id: ClientId) {
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            debug!("Write to client #{} failed: {}", client_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tandem_core::clock::{ClockOffsetEstimate, ClockSyncConfig, Confidence};
    use tandem_core::network::{connect, ConnectionConfig, ConnectionHandle};
    use tandem_core::output::SilentOutput;
    use tandem_core::session::{ClientConfig, Session, SessionCallback};
    use tandem_core::sync::{
        AudioInfo, AudioPayload, PlaybackEventKind, PlaybackState, ServerEvent, StateUpdate, StopReason,
    };
    use tokio::io::AsyncBufReadExt;

    async fn start_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let metrics = Arc::new(RwLock::new(Metrics::new()));
        let ctx = ServerContext::new(&ServerConfig::default(), metrics);
        tokio::spawn(serve(listener, ctx));
        addr
    }

    fn song() -> AudioPayload {
        AudioPayload {
            name: "song.mp3".to_string(),
            mime_type: "audio/mpeg".to_string(),
            bytes: vec![7; 64],
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("connection open")
    }

    async fn connect_client(addr: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        connect(addr, &ConnectionConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_client_flow_over_tcp() {
        let addr = start_server().await;
        let (client, mut events) = connect_client(&addr).await;

        // Initial state on connect
        let event = next_event(&mut events).await;
        assert_eq!(
            event,
            ServerEvent::Playback {
                kind: PlaybackEventKind::Snapshot,
                update: StateUpdate {
                    seq: 0,
                    state: PlaybackState::STOPPED
                }
            }
        );

        // Probe is echoed and stamped with the server clock
        let before = tandem_core::time::current_time_ms();
        let reply = client.time_sync(123).await.unwrap();
        assert_eq!(reply.echoed_send_time, 123);
        assert!(reply.reference_now >= before);

        // Nothing to control before an upload
        assert_eq!(client.play(None).await.unwrap(), CommandOutcome::NothingToControl);

        let outcome = client.upload_audio(song()).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Applied(u) if u.state == PlaybackState::STOPPED));
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::Playback { kind: PlaybackEventKind::Stop(StopReason::SourceChanged), .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::AudioAvailable(AudioInfo { ref name, .. }) if name == "song.mp3"
        ));

        let now = tandem_core::time::current_time_ms();
        let CommandOutcome::Applied(played) = client.play(Some(500)).await.unwrap() else {
            panic!("play should apply once audio is loaded");
        };
        assert!(played.state.is_playing);
        assert!(played.state.start_time >= now + 500);

        let event = next_event(&mut events).await;
        assert_eq!(
            event,
            ServerEvent::Playback {
                kind: PlaybackEventKind::Play,
                update: played
            }
        );

        let audio = client.request_audio().await.unwrap().unwrap();
        assert_eq!(audio.bytes, vec![7; 64]);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_state_then_announcement() {
        let addr = start_server().await;
        let (first, _first_events) = connect_client(&addr).await;
        first.upload_audio(song()).await.unwrap();
        first.play(Some(0)).await.unwrap();

        let (_late, mut events) = connect_client(&addr).await;
        let ServerEvent::Playback { kind, update } = next_event(&mut events).await else {
            panic!("expected playback state first");
        };
        assert_eq!(kind, PlaybackEventKind::Snapshot);
        assert!(update.state.is_playing);
        assert!(matches!(next_event(&mut events).await, ServerEvent::AudioAvailable(_)));
    }

    #[tokio::test]
    async fn test_broadcasts_reach_every_client_in_order() {
        let addr = start_server().await;
        let (controller, _) = connect_client(&addr).await;
        controller.upload_audio(song()).await.unwrap();

        let mut listeners = Vec::new();
        for _ in 0..3 {
            let (handle, mut events) = connect_client(&addr).await;
            next_event(&mut events).await; // snapshot
            next_event(&mut events).await; // announcement
            listeners.push((handle, events));
        }

        let commands = (0..6).map(|i| {
            let controller = controller.clone();
            async move {
                if i % 2 == 0 {
                    controller.seek(i * 1_000).await
                } else {
                    controller.play(Some(100)).await
                }
            }
        });
        for outcome in futures::future::join_all(commands).await {
            assert!(matches!(outcome.unwrap(), CommandOutcome::Applied(_)));
        }

        let mut seen = Vec::new();
        for (_, events) in listeners.iter_mut() {
            let mut seqs = Vec::new();
            for _ in 0..6 {
                if let ServerEvent::Playback { update, .. } = next_event(events).await {
                    seqs.push(update.seq);
                }
            }
            assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
            seen.push(seqs);
        }
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_answered() {
        let addr = start_server().await;
        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Initial state
        lines.next_line().await.unwrap().unwrap();

        write_half
            .write_all(b"{\"id\":5,\"message\":{\"warp\":1}}\n")
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: ServerMessage = serde_json::from_str(&line).unwrap();
        assert!(matches!(reply, ServerMessage::Reply { id: 5, reply: Reply::Error { .. } }));
    }

    #[derive(Default)]
    struct Recorder {
        synced: Mutex<Option<ClockOffsetEstimate>>,
        loaded: Mutex<Vec<String>>,
        playback: Mutex<Vec<(PlaybackEventKind, u64)>>,
        errors: Mutex<Vec<String>>,
    }

    impl SessionCallback for Recorder {
        fn on_playback_changed(&self, kind: PlaybackEventKind, update: StateUpdate) {
            self.playback.lock().push((kind, update.seq));
        }
        fn on_audio_available(&self, _info: AudioInfo) {}
        fn on_audio_loaded(&self, info: AudioInfo, _duration: Duration) {
            self.loaded.lock().push(info.name);
        }
        fn on_clock_synced(&self, estimate: ClockOffsetEstimate) {
            *self.synced.lock() = Some(estimate);
        }
        fn on_error(&self, message: String) {
            self.errors.lock().push(message);
        }
        fn on_disconnected(&self) {}
    }

    #[tokio::test]
    async fn test_session_syncs_loads_and_schedules() {
        let addr = start_server().await;
        let recorder = Arc::new(Recorder::default());
        let config = ClientConfig {
            server_addr: addr,
            clock_sync: ClockSyncConfig {
                rounds: 4,
                round_delay_min: Duration::from_millis(1),
                round_delay_max: Duration::from_millis(2),
                ..ClockSyncConfig::default()
            },
            ..ClientConfig::default()
        };
        let output = Arc::new(SilentOutput::new(Duration::from_secs(60)));
        let session = Session::connect(config, output, recorder.clone()).await.unwrap();

        // Same host, so the offset should be tiny
        let estimate = recorder.synced.lock().expect("synced on connect");
        assert_eq!(estimate.confidence, Confidence::Measured);
        assert!(estimate.offset_ms.abs() < 50.0);

        session.upload_audio("song.mp3", "audio/mpeg", vec![1; 32]).await.unwrap();
        session.play(Some(300)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.scheduler().is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scheduled in time");

        assert_eq!(recorder.loaded.lock().as_slice(), ["song.mp3".to_string()]);
        assert!(recorder.errors.lock().is_empty());
        assert!(recorder
            .playback
            .lock()
            .iter()
            .any(|(kind, _)| *kind == PlaybackEventKind::Play));

        session.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.scheduler().is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stopped in time");

        session.disconnect().await;
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn test_session_reloads_after_source_change() {
        let addr = start_server().await;
        let recorder = Arc::new(Recorder::default());
        let config = ClientConfig {
            server_addr: addr,
            sync_on_connect: false,
            ..ClientConfig::default()
        };
        let output = Arc::new(SilentOutput::new(Duration::from_secs(60)));
        let session = Session::connect(config, output, recorder.clone()).await.unwrap();

        session.upload_audio("first.mp3", "audio/mpeg", vec![1; 32]).await.unwrap();
        session.play(Some(300)).await.unwrap();
        wait_until("first source scheduled", || session.scheduler().is_active()).await;

        let CommandOutcome::Applied(changed) = session
            .upload_audio("second.mp3", "audio/mpeg", vec![2; 32])
            .await
            .unwrap()
        else {
            panic!("upload should reset playback");
        };

        // The source change stops the voice before the new audio arrives
        wait_until("source change handled", || {
            session.latest_state().map(|u| u.seq) >= Some(changed.seq)
        })
        .await;
        assert!(!session.scheduler().is_active());
        wait_until("second source loaded", || recorder.loaded.lock().len() == 2).await;
        assert!(session.scheduler().has_audio());
        assert!(!session.scheduler().is_active());

        session.play(Some(300)).await.unwrap();
        wait_until("second source scheduled", || session.scheduler().is_active()).await;

        assert_eq!(
            recorder.loaded.lock().as_slice(),
            ["first.mp3".to_string(), "second.mp3".to_string()]
        );
        assert!(recorder
            .playback
            .lock()
            .iter()
            .any(|(kind, seq)| *kind == PlaybackEventKind::Stop(StopReason::SourceChanged) && *seq == changed.seq));
        assert!(recorder.errors.lock().is_empty());

        session.disconnect().await;
    }
}
