//! WebSocket relay with room-based fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌──► Client B
//!             ├── Room "crm" ── BroadcastGroup ┤
//! Client B ──┘      (opaque frames)          └──► Client A   (echo suppressed)
//!
//! Client C ──── Room "other" ── BroadcastGroup ──► nobody else
//! ```
//!
//! The relay is content-agnostic: it never decodes a frame, keeps no
//! document state and performs no merge. Every binary frame received
//! from a connection is rebroadcast verbatim to every other connection
//! in the same room.
//!
//! Addressing: `ws://host:port<path>?room=<name>` (form-encoded) or
//! `ws://host:port<path>/<name>` (segment taken verbatim); without either
//! the default room is used.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnId, RoomManager};
use crate::protocol::ProtocolError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// URL path prefix accepted for upgrades; anything else gets a 404
    pub path: String,
    /// Room used when the request names none
    pub default_room: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Close a connection after this long without inbound traffic
    pub idle_timeout_secs: u64,
    /// Give up on a single outbound frame after this long
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path: "/sync".to_string(),
            default_room: "crm".to_string(),
            broadcast_capacity: 256,
            idle_timeout_secs: 60,
            write_timeout_secs: 10,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub lagged_disconnects: u64,
}

/// Pick the room for a request path, or `None` if the path is not served.
///
/// Order: `room` query parameter, first path segment after `prefix`,
/// then `default_room`.
pub fn resolve_room(path: &str, query: Option<&str>, prefix: &str, default_room: &str) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }

    let from_query = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, value)| key == "room" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    });
    if from_query.is_some() {
        return from_query;
    }

    let from_path = rest
        .split('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string);
    Some(from_path.unwrap_or_else(|| default_room.to_string()))
}

async fn send_with_timeout<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), ProtocolError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match timeout(limit, sink.send(msg)).await {
        Ok(result) => result.map_err(ProtocolError::from),
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Shared state handed to every connection task.
///
/// Counters are atomics; the frame path never takes a lock shared
/// between rooms.
struct Relay {
    config: ServerConfig,
    rooms: RoomManager,
    next_conn: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    lagged_disconnects: AtomicU64,
}

/// The relay server.
pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            relay: Arc::new(Relay {
                config,
                rooms,
                next_conn: AtomicU64::new(1),
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                total_frames: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                lagged_disconnects: AtomicU64::new(0),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!(
            "Relay listening on {} (path {})",
            listener.local_addr()?,
            self.relay.config.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: Arc<Relay>) -> Result<(), ProtocolError> {
        let config = &relay.config;
        let write_limit = Duration::from_secs(config.write_timeout_secs);
        let mut room: Option<String> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match resolve_room(req.uri().path(), req.uri().query(), &config.path, &config.default_room) {
                Some(name) => {
                    room = Some(name);
                    Ok(resp)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some(format!("no relay at {}", req.uri().path())));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            }
        });
        let ws_stream = match timeout(write_limit, handshake).await {
            Ok(ws) => ws?,
            Err(_) => {
                log::debug!("Upgrade from {addr} not completed within {write_limit:?}, dropping");
                return Err(ProtocolError::Timeout);
            }
        };
        let room = room.unwrap_or_else(|| config.default_room.clone());

        let conn_id: ConnId = relay.next_conn.fetch_add(1, Ordering::Relaxed);
        let (group, mut rx) = relay.rooms.join(&room, conn_id).await;
        relay.total_connections.fetch_add(1, Ordering::Relaxed);
        relay.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} joined room '{room}'");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let idle = Duration::from_secs(config.idle_timeout_secs);
        let mut outcome = Ok(());
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    log::info!("Connection {conn_id} idle for {idle:?}, closing");
                    break;
                }

                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    deadline = Instant::now() + idle;
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            relay.total_frames.fetch_add(1, Ordering::Relaxed);
                            relay.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            let receivers = group.broadcast(conn_id, bytes);
                            log::trace!("Room '{room}': frame from {conn_id} to {} receivers", receivers.saturating_sub(1));
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Ignoring text frame from connection {conn_id}");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = send_with_timeout(&mut ws_sender, Message::Pong(data), write_limit).await {
                                outcome = Err(e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }
                        Some(Err(e)) => {
                            outcome = Err(e.into());
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing room frame
                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.origin == conn_id {
                                continue;
                            }
                            let msg = Message::Binary(frame.bytes.clone().into());
                            if let Err(e) = send_with_timeout(&mut ws_sender, msg, write_limit).await {
                                outcome = Err(e);
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} in room '{room}' lagged by {n} frames, disconnecting");
                            relay.lagged_disconnects.fetch_add(1, Ordering::Relaxed);
                            let _ = send_with_timeout(&mut ws_sender, Message::Close(None), write_limit).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        // Cleanup: leave room, tear it down if empty
        drop(rx);
        relay.rooms.leave(&room, conn_id).await;
        relay.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} left room '{room}'");

        outcome
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let relay = &self.relay;
        ServerStats {
            total_connections: relay.total_connections.load(Ordering::Relaxed),
            active_connections: relay.active_connections.load(Ordering::Relaxed),
            total_frames: relay.total_frames.load(Ordering::Relaxed),
            total_bytes: relay.total_bytes.load(Ordering::Relaxed),
            active_rooms: relay.rooms.room_count().await,
            lagged_disconnects: relay.lagged_disconnects.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.relay.config
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.relay.rooms
    }
}
