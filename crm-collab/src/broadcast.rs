//! Per-room fan-out of opaque frames.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind is told it
//! lagged and the relay drops that connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Relay-local connection identifier.
pub type ConnId = u64;

/// One relayed frame and the connection it came from.
#[derive(Debug)]
pub struct Frame {
    pub origin: ConnId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub active_members: usize,
}

/// A broadcast group for a single room.
///
/// All connections in the same room share one broadcast channel.
/// Echo suppression is the receiver's job: it skips frames whose
/// `origin` is its own connection id.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    members: RwLock<HashSet<ConnId>>,
    capacity: usize,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection; returns its receiver.
    pub async fn add_member(&self, conn: ConnId) -> broadcast::Receiver<Arc<Frame>> {
        let mut members = self.members.write().await;
        members.insert(conn);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, conn: ConnId) -> bool {
        self.members.write().await.remove(&conn)
    }

    /// Fan a frame out to every receiver, the sender's included.
    ///
    /// Lock-free: tokio broadcast send plus atomic stats.
    /// Returns the number of receivers.
    pub fn broadcast(&self, origin: ConnId, bytes: Vec<u8>) -> usize {
        let len = bytes.len() as u64;
        let count = self
            .sender
            .send(Arc::new(Frame { origin, bytes }))
            .unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, conn: ConnId) -> bool {
        self.members.read().await.contains(&conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps room names to broadcast groups.
///
/// Rooms are created on first join and removed when the last member
/// leaves. Joins hold the map's read lock while registering, teardown
/// holds the write lock while re-checking emptiness, so a join never
/// lands in a room that is being removed.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register `conn` in `room`, creating the room if needed.
    pub async fn join(&self, room: &str, conn: ConnId) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<Frame>>) {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                let rx = group.add_member(conn).await;
                return (group.clone(), rx);
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        let group = match rooms.get(room) {
            Some(group) => group.clone(),
            None => {
                log::info!("Room '{room}' created");
                let group = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(room.to_string(), group.clone());
                group
            }
        };
        let rx = group.add_member(conn).await;
        (group, rx)
    }

    /// Remove `conn` from `room`; tears the room down if it became empty.
    ///
    /// Returns whether the room was removed.
    pub async fn leave(&self, room: &str, conn: ConnId) -> bool {
        let group = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(group) => group.clone(),
                None => return false,
            }
        };
        group.remove_member(conn).await;
        if group.member_count().await > 0 {
            return false;
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room) {
            if group.member_count().await == 0 {
                rooms.remove(room);
                log::info!("Room '{room}' removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
