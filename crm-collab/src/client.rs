//! WebSocket sync client: keeps one logical connection between a replica
//! and its room on the relay.
//!
//! ```text
//!                ┌──────────── supervisor task ─────────────┐
//! send_delta ──► │ Link ──out_tx──► sink ──► relay           │
//!   (queued      │                                           │
//!   if offline)  │ relay ──► stream ──► decode ──► SyncEvent │ ──► event_rx
//!                │ heartbeat ping · idle deadline · backoff  │
//!                └───────────────────────────────────────────┘
//! ```
//!
//! The client never touches the document. It hands decoded events to
//! whoever owns the document (see [`crate::replica::Replica`]) and sends
//! whatever frames it is given.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::backoff::{Backoff, BackoffConfig};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replica-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub room: String,
    /// Relay endpoint; the room is appended as `?room=<room>`
    pub relay_url: String,
    /// Persist snapshots and pending deltas through the store
    pub durability: bool,
    pub offline_queue_capacity: usize,
    /// Bounds the connect handshake and every frame write
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Drop the connection after this long without inbound traffic
    pub idle_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            room: "crm".to_string(),
            relay_url: "ws://127.0.0.1:9090/sync".to_string(),
            durability: true,
            offline_queue_capacity: 10_000,
            connect_timeout_secs: 5,
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 45,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Full relay URL including the room, percent-encoded as a query pair.
    pub fn room_url(&self) -> Result<Url, ProtocolError> {
        let mut url = Url::parse(&self.relay_url)
            .map_err(|e| ProtocolError::InvalidUrl(format!("{}: {e}", self.relay_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ProtocolError::InvalidUrl(self.relay_url.clone()));
        }
        url.query_pairs_mut().append_pair("room", &self.room);
        Ok(url)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established and the offline queue flushed
    Connected,
    /// Connection lost
    Disconnected,
    /// Incremental update from a remote peer
    RemoteDelta { peer_id: Uuid, update: Vec<u8> },
    /// A peer announced its version state and wants what it lacks
    SyncRequest { peer_id: Uuid, state: Vec<u8> },
    /// Answer to our own announcement
    SyncReply {
        peer_id: Uuid,
        missing: Vec<u8>,
        state: Vec<u8>,
    },
}

/// Offline queue for deltas produced while disconnected.
///
/// Bounded; a full queue refuses new deltas and never evicts old ones.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Drain all queued deltas, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// Where outbound frames go right now.
struct Link {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queue: OfflineQueue,
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    peer_id: Uuid,
    config: ClientConfig,
    url: String,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reconnect until shut down.
    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let connect_limit = Duration::from_secs(self.config.connect_timeout_secs);
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            let stopped = match timeout(connect_limit, tokio_tungstenite::connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    backoff.reset();
                    self.session(ws, &mut shutdown).await
                }
                Ok(Err(e)) => {
                    log::debug!("Connect to {} failed: {e}", self.url);
                    false
                }
                Err(_) => {
                    log::debug!("Connect to {} timed out after {connect_limit:?}", self.url);
                    false
                }
            };
            self.state.send_replace(ConnectionState::Disconnected);
            if stopped {
                break;
            }

            let delay = backoff.next_delay();
            log::debug!(
                "Reconnecting to {} in {delay:?} (attempt {})",
                self.url,
                backoff.attempt()
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Sync client {} stopped", self.peer_id);
    }

    /// Pump one connection. Returns `true` if it ended because of shutdown.
    async fn session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Flush the backlog ahead of anything sent after this point
        {
            let mut link = self.link();
            let queued = link.queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued deltas", queued.len());
            }
            for update in queued {
                match SyncMessage::delta(self.peer_id, update).encode() {
                    Ok(frame) => {
                        let _ = out_tx.send(frame);
                    }
                    Err(e) => log::warn!("Dropping queued delta: {e}"),
                }
            }
            link.outgoing = Some(out_tx);
        }
        self.state.send_replace(ConnectionState::Connected);
        let _ = self.events.send(SyncEvent::Connected);
        log::info!("Connected to {} as {}", self.url, self.peer_id);

        let write_limit = Duration::from_secs(self.config.connect_timeout_secs);
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        let heartbeat_every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut deadline = Instant::now() + idle;

        let stopped = loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break false };
                    let msg = Message::Binary(frame.into());
                    if let Err(e) = write(&mut sink, msg, write_limit).await {
                        log::debug!("Send failed: {e}");
                        break false;
                    }
                }

                msg = stream.next() => {
                    deadline = Instant::now() + idle;
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            self.dispatch(&bytes);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write(&mut sink, Message::Pong(data), write_limit).await.is_err() {
                                break false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break false,
                        Some(Err(e)) => {
                            log::debug!("Connection error: {e}");
                            break false;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                _ = heartbeat.tick() => {
                    if write(&mut sink, Message::Ping(Vec::new().into()), write_limit).await.is_err() {
                        break false;
                    }
                }

                _ = sleep_until(deadline) => {
                    log::info!("No traffic from relay for {idle:?}, reconnecting");
                    break false;
                }

                _ = shutdown.changed() => {
                    let _ = write(&mut sink, Message::Close(None), write_limit).await;
                    break true;
                }
            }
        };

        self.link().outgoing = None;
        let _ = self.events.send(SyncEvent::Disconnected);
        log::info!("Disconnected from {}", self.url);
        stopped
    }

    /// Decode one inbound frame and forward it as an event.
    fn dispatch(&self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame ({} bytes): {e}", bytes.len());
                return;
            }
        };
        if !msg.is_for(self.peer_id) {
            return;
        }

        let peer_id = msg.peer_id;
        let event = match msg.msg_type {
            MessageType::Delta => SyncEvent::RemoteDelta {
                peer_id,
                update: msg.payload,
            },
            MessageType::SyncStep1 => SyncEvent::SyncRequest {
                peer_id,
                state: msg.payload,
            },
            MessageType::SyncStep2 => match msg.sync_reply() {
                Ok(reply) => SyncEvent::SyncReply {
                    peer_id,
                    missing: reply.missing,
                    state: reply.state,
                },
                Err(e) => {
                    log::warn!("Dropping malformed sync reply from {peer_id}: {e}");
                    return;
                }
            },
        };
        let _ = self.events.send(event);
    }
}

async fn write<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), ProtocolError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match timeout(limit, sink.send(msg)).await {
        Ok(result) => result.map_err(ProtocolError::from),
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// The sync client.
pub struct SyncClient {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_peer_id(config, Uuid::new_v4())
    }

    pub fn with_peer_id(config: ClientConfig, peer_id: Uuid) -> Self {
        let (mut client, event_rx) = Self::with_events(config, peer_id);
        client.event_rx = Some(event_rx);
        client
    }

    /// Build a client and hand its event stream straight to the caller.
    pub fn with_events(config: ClientConfig, peer_id: Uuid) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        // An unusable URL is reported by `connect`
        let url = config
            .room_url()
            .map(String::from)
            .unwrap_or_else(|_| config.relay_url.clone());
        let queue = OfflineQueue::new(config.offline_queue_capacity);
        let client = Self {
            shared: Arc::new(Shared {
                peer_id,
                config,
                url,
                link: Mutex::new(Link { outgoing: None, queue }),
                state: state_tx,
                events: event_tx,
            }),
            state_rx,
            event_rx: None,
            shutdown_tx,
            task: None,
        };
        (client, event_rx)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start the supervisor task. Connecting, retrying and reconnecting
    /// all happen in the background; watch [`Self::status`] for progress.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.task.is_some() {
            return Ok(());
        }
        self.shared.config.room_url()?;
        self.shutdown_tx.send_replace(false);
        let shutdown = self.shutdown_tx.subscribe();
        self.task = Some(tokio::spawn(self.shared.clone().supervise(shutdown)));
        Ok(())
    }

    /// Stop the supervisor task and close the connection.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Send a delta, or queue it while offline.
    ///
    /// Returns `false` if the delta was neither sent nor queued (queue full).
    pub fn send_delta(&self, update: Vec<u8>) -> bool {
        let mut link = self.shared.link();
        if let Some(tx) = &link.outgoing {
            match SyncMessage::delta(self.shared.peer_id, update.clone()).encode() {
                Ok(frame) => {
                    if tx.send(frame).is_ok() {
                        return true;
                    }
                }
                Err(e) => {
                    log::warn!("Failed to encode delta: {e}");
                    return false;
                }
            }
        }
        if link.queue.enqueue(update) {
            true
        } else {
            log::warn!(
                "Offline queue full ({} deltas), delta kept only in local state",
                link.queue.len()
            );
            false
        }
    }

    /// Send a handshake message. Returns `false` when offline; handshakes
    /// are not queued because every reconnect starts a fresh one.
    pub fn send(&self, msg: &SyncMessage) -> Result<bool, ProtocolError> {
        let frame = msg.encode()?;
        let link = self.shared.link();
        Ok(match &link.outgoing {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        })
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn room(&self) -> &str {
        &self.shared.config.room
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn offline_queue_len(&self) -> usize {
        self.shared.link().queue.len()
    }

    pub fn offline_queue_bytes(&self) -> usize {
        self.shared.link().queue.total_bytes()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
