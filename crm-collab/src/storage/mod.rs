//! Local durability for replicas.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot after   ┌───────────────┐
//! │ Replica     │ ─── every change ►│ Durability    │ logs, never fails
//! │ (Document)  │  pending deltas   └──────┬────────┘
//! └──────┬──────┘                          │ dyn SnapshotStore
//!        │ on open                         ▼
//!        │                 ┌──────────────────────────────────┐
//!        └───── restore ◄──│ DocumentStore (RocksDB)           │
//!                          │   CF "snapshots" : latest state   │
//!                          │   CF "pending"   : unsent deltas  │
//!                          │   CF "metadata"  : sizes, times   │
//!                          │ MemoryStore (BTreeMap)            │
//!                          └──────────────────────────────────┘
//! ```
//!
//! Snapshots are overwritten, not appended: the latest export is all a
//! replica needs to come back. Pending deltas are what the replica
//! produced since it was last connected; they are replayed into the
//! offline queue on restart and cleared once a connection is up.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, RoomMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Nothing stored for this room
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(room) => write!(f, "Room not found: {room}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// A durable key-value home for room snapshots and unsent deltas.
pub trait SnapshotStore: Send + Sync {
    /// Last saved snapshot for `room`, if any.
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot for `room`.
    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    fn append_pending(&self, room: &str, delta: &[u8]) -> Result<(), StoreError>;

    /// Pending deltas in append order.
    fn load_pending(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    fn clear_pending(&self, room: &str) -> Result<(), StoreError>;
}

/// Store adapter bound to one room that turns every failure into a log line.
///
/// The in-memory document stays authoritative; a failed write is retried
/// implicitly by the next one, which carries the newer snapshot.
pub struct Durability {
    room: String,
    store: Option<Box<dyn SnapshotStore>>,
    failures: u64,
}

impl Durability {
    pub fn new(room: impl Into<String>, store: Box<dyn SnapshotStore>) -> Self {
        Self {
            room: room.into(),
            store: Some(store),
            failures: 0,
        }
    }

    /// Durability switched off: every call is a no-op.
    pub fn disabled(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            store: None,
            failures: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Number of failed store calls so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn load(&mut self) -> Option<Vec<u8>> {
        let store = self.store.as_ref()?;
        let result = store.load(&self.room);
        self.check("load snapshot", result).flatten()
    }

    pub fn save(&mut self, snapshot: &[u8]) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let result = store.save(&self.room, snapshot);
        self.check("save snapshot", result).is_some()
    }

    pub fn append_pending(&mut self, delta: &[u8]) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let result = store.append_pending(&self.room, delta);
        self.check("append pending delta", result).is_some()
    }

    pub fn load_pending(&mut self) -> Vec<Vec<u8>> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        let result = store.load_pending(&self.room);
        self.check("load pending deltas", result).unwrap_or_default()
    }

    pub fn clear_pending(&mut self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let result = store.clear_pending(&self.room);
        self.check("clear pending deltas", result).is_some()
    }

    fn check<T>(&mut self, what: &str, result: Result<T, StoreError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failures += 1;
                log::error!("Failed to {what} for room '{}': {e}", self.room);
                None
            }
        }
    }
}

impl std::fmt::Debug for Durability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Durability")
            .field("room", &self.room)
            .field("enabled", &self.is_enabled())
            .field("failures", &self.failures)
            .finish()
    }
}
