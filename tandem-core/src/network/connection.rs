//! Client connection to a tandem server
//!
//! A reader task routes replies to the request waiting for them and forwards
//! everything else as [`ServerEvent`]s. A writer task owns the write half.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::{TimeProbe, TimeReply};
use crate::sync::{AudioPayload, ClientMessage, CommandOutcome, Reply, Request, ServerEvent, ServerMessage};

use super::codec::{write_frame, FrameError, FrameReader, DEFAULT_MAX_FRAME_BYTES};

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("Server rejected request: {0}")]
    Rejected(String),
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for any reply. Uploads need the most.
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

enum Outgoing {
    Frame(Request),
    Close,
}

type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<Reply>>>;

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<PendingReplies>,
    closed: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
    peer: SocketAddr,
}

/// Removes an abandoned request from the pending table
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Connect to `addr` and start the reader and writer tasks.
///
/// Server events arrive on the returned receiver, which closes when the
/// connection does.
pub async fn connect(
    addr: &str,
    config: &ConnectionConfig,
) -> Result<(ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>), NetworkError> {
    let stream = TcpStream::connect(addr).await.map_err(|source| NetworkError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    let peer = stream.peer_addr().map_err(|source| NetworkError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    info!("Connected to {}", peer);

    let (read_half, write_half) = stream.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let pending: Arc<PendingReplies> = Arc::new(Mutex::new(HashMap::new()));
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(write_loop(write_half, outgoing_rx));
    tokio::spawn(read_loop(
        FrameReader::new(BufReader::new(read_half), config.max_frame_bytes),
        ReadSide {
            pending: pending.clone(),
            closed: closed.clone(),
            outgoing: outgoing_tx.downgrade(),
            events: event_tx,
        },
    ));

    let handle = ConnectionHandle {
        outgoing: outgoing_tx,
        pending,
        closed,
        next_id: Arc::new(AtomicU64::new(1)),
        request_timeout: config.request_timeout,
        peer,
    };
    Ok((handle, event_rx))
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the server side has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, message: ClientMessage) -> Result<Reply, NetworkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = message.event_name();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            // Checked under the lock the reader clears on exit
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(NetworkError::Closed);
            }
            pending.insert(id, reply_tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.outgoing
            .send(Outgoing::Frame(Request { id, message }))
            .map_err(|_| NetworkError::Closed)?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Reply::Error { message })) => {
                debug!("Request {} ({}) rejected: {}", id, name, message);
                Err(NetworkError::Rejected(message))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => {
                warn!("Request {} ({}) timed out", id, name);
                Err(NetworkError::Timeout(self.request_timeout))
            }
        }
    }

    /// One clock-sync round trip
    pub async fn time_sync(&self, client_send_time: i64) -> Result<TimeReply, NetworkError> {
        match self.request(ClientMessage::TimeSync { client_send_time }).await? {
            Reply::TimeSync {
                reference_now,
                echoed_send_time,
            } => Ok(TimeReply {
                reference_now,
                echoed_send_time,
            }),
            _ => Err(NetworkError::UnexpectedReply("timesync")),
        }
    }

    pub async fn play(&self, delay_ms: Option<i64>) -> Result<CommandOutcome, NetworkError> {
        self.command(ClientMessage::Play { delay_ms }).await
    }

    pub async fn pause(&self) -> Result<CommandOutcome, NetworkError> {
        self.command(ClientMessage::Pause).await
    }

    pub async fn seek(&self, position_ms: i64) -> Result<CommandOutcome, NetworkError> {
        self.command(ClientMessage::Seek { position_ms }).await
    }

    pub async fn stop(&self) -> Result<CommandOutcome, NetworkError> {
        self.command(ClientMessage::Stop).await
    }

    pub async fn upload_audio(&self, payload: AudioPayload) -> Result<CommandOutcome, NetworkError> {
        self.command(ClientMessage::UploadAudio(payload)).await
    }

    pub async fn request_audio(&self) -> Result<Option<Arc<AudioPayload>>, NetworkError> {
        match self.request(ClientMessage::RequestAudio).await? {
            Reply::Audio(audio) => Ok(audio),
            _ => Err(NetworkError::UnexpectedReply("request_audio")),
        }
    }

    /// Close the write side; the server then closes the connection
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    async fn command(&self, message: ClientMessage) -> Result<CommandOutcome, NetworkError> {
        let name = message.event_name();
        match self.request(message).await? {
            Reply::Command(outcome) => Ok(outcome),
            _ => Err(NetworkError::UnexpectedReply(name)),
        }
    }
}

impl TimeProbe for ConnectionHandle {
    type Error = NetworkError;

    async fn probe(&self, client_send_time: i64) -> Result<TimeReply, NetworkError> {
        self.time_sync(client_send_time).await
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(request) => {
                if let Err(e) = write_frame(&mut writer, &request).await {
                    warn!("Failed to send request {}: {}", request.id, e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    debug!("Connection writer stopped");
}

/// What the reader task shares with the handle
struct ReadSide {
    pending: Arc<PendingReplies>,
    closed: Arc<AtomicBool>,
    outgoing: mpsc::WeakUnboundedSender<Outgoing>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

async fn read_loop(mut reader: FrameReader<BufReader<OwnedReadHalf>>, side: ReadSide) {
    let ReadSide {
        pending,
        closed,
        outgoing,
        events,
    } = side;
    loop {
        match reader.next::<ServerMessage>().await {
            Ok(Some(message)) => match ServerEvent::from_message(message) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        debug!("Event receiver dropped, still routing replies");
                    }
                }
                Err((id, reply)) => {
                    let waiter = pending.lock().remove(&id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(reply);
                        }
                        None => debug!("Reply for unknown request {}", id),
                    }
                }
            },
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(FrameError::Json(e)) => warn!("Ignoring malformed frame from server: {}", e),
            Err(e) => {
                warn!("Connection read failed: {}", e);
                break;
            }
        }
    }
    // Fail new requests fast and wake everyone still waiting
    {
        let mut pending = pending.lock();
        closed.store(true, Ordering::Release);
        pending.clear();
    }
    if let Some(outgoing) = outgoing.upgrade() {
        let _ = outgoing.send(Outgoing::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{PlaybackState, StateUpdate};
    use tokio::net::TcpListener;

    /// Accept one connection and hand back its frame reader and write half
    async fn fake_server() -> (String, tokio::task::JoinHandle<(FrameReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            (FrameReader::new(BufReader::new(read_half), 1 << 20), write_half)
        });
        (addr, accept)
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_id() {
        let (addr, accept) = fake_server().await;
        let (handle, _events) = connect(&addr, &ConnectionConfig::default()).await.unwrap();
        let (mut reader, mut writer) = accept.await.unwrap();

        let pause = tokio::spawn({
            let handle = handle.clone();
            async move { handle.pause().await }
        });
        let sync = tokio::spawn({
            let handle = handle.clone();
            async move { handle.time_sync(1_000).await }
        });

        let first: Request = reader.next().await.unwrap().unwrap();
        let second: Request = reader.next().await.unwrap().unwrap();

        // Answer in reverse order
        for request in [second, first] {
            let reply = match request.message {
                ClientMessage::TimeSync { client_send_time } => Reply::TimeSync {
                    reference_now: 5_000,
                    echoed_send_time: client_send_time,
                },
                _ => Reply::Command(CommandOutcome::Unchanged),
            };
            write_frame(&mut writer, &ServerMessage::Reply { id: request.id, reply })
                .await
                .unwrap();
        }

        assert_eq!(pause.await.unwrap().unwrap(), CommandOutcome::Unchanged);
        assert_eq!(
            sync.await.unwrap().unwrap(),
            TimeReply {
                reference_now: 5_000,
                echoed_send_time: 1_000
            }
        );
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (addr, accept) = fake_server().await;
        let (_handle, mut events) = connect(&addr, &ConnectionConfig::default()).await.unwrap();
        let (_reader, mut writer) = accept.await.unwrap();

        let update = StateUpdate {
            seq: 4,
            state: PlaybackState::STOPPED,
        };
        write_frame(&mut writer, &ServerMessage::PlaybackState(update)).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::Playback { update: u, .. } if u.seq == 4));

        drop(writer);
        drop(_reader);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timed_out_request_is_forgotten() {
        let (addr, accept) = fake_server().await;
        let config = ConnectionConfig {
            request_timeout: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (handle, _events) = connect(&addr, &config).await.unwrap();
        let (_reader, _writer) = accept.await.unwrap();

        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout(_)));
        assert!(handle.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_server_goes_away() {
        let (addr, accept) = fake_server().await;
        let (handle, _events) = connect(&addr, &ConnectionConfig::default()).await.unwrap();
        let (mut reader, writer) = accept.await.unwrap();

        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request_audio().await }
        });
        let _: Request = reader.next().await.unwrap().unwrap();
        drop(writer);
        drop(reader);

        assert!(matches!(request.await.unwrap(), Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_after_server_closes() {
        let (addr, accept) = fake_server().await;
        let config = ConnectionConfig {
            request_timeout: Duration::from_secs(5),
            ..ConnectionConfig::default()
        };
        let (handle, mut events) = connect(&addr, &config).await.unwrap();
        let (reader, writer) = accept.await.unwrap();
        drop(writer);
        drop(reader);

        // The event stream ends once the reader has seen the close
        assert!(events.recv().await.is_none());
        assert!(handle.is_closed());

        let result = tokio::time::timeout(Duration::from_secs(1), handle.pause())
            .await
            .expect("request should not wait for the timeout");
        assert!(matches!(result, Err(NetworkError::Closed)));
        assert!(handle.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_is_rejection() {
        let (addr, accept) = fake_server().await;
        let (handle, _events) = connect(&addr, &ConnectionConfig::default()).await.unwrap();
        let (mut reader, mut writer) = accept.await.unwrap();

        let request = tokio::spawn({
            let handle = handle.clone();
            async move { handle.seek(10).await }
        });
        let frame: Request = reader.next().await.unwrap().unwrap();
        write_frame(
            &mut writer,
            &ServerMessage::Reply {
                id: frame.id,
                reply: Reply::Error {
                    message: "bad seek".to_string(),
                },
            },
        )
        .await
        .unwrap();

        assert!(matches!(request.await.unwrap(), Err(NetworkError::Rejected(m)) if m == "bad seek"));
    }
}
