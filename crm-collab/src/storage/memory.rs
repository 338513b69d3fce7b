//! In-process store for tests and for replicas that run without disk.
//!
//! Clones share the same rooms, so a "restarted" replica can reopen
//! what the previous instance wrote.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{SnapshotStore, StoreError};

#[derive(Debug, Default)]
struct RoomState {
    snapshot: Option<Vec<u8>>,
    pending: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rooms: Arc<Mutex<BTreeMap<String, RoomState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, BTreeMap<String, RoomState>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self, room: &str) -> Option<Vec<u8>> {
        self.rooms().get(room).and_then(|r| r.snapshot.clone())
    }

    pub fn pending(&self, room: &str) -> Vec<Vec<u8>> {
        self.rooms()
            .get(room)
            .map(|r| r.pending.clone())
            .unwrap_or_default()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms().keys().cloned().collect()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshot(room))
    }

    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.rooms().entry(room.to_string()).or_default().snapshot = Some(snapshot.to_vec());
        Ok(())
    }

    fn append_pending(&self, room: &str, delta: &[u8]) -> Result<(), StoreError> {
        self.rooms()
            .entry(room.to_string())
            .or_default()
            .pending
            .push(delta.to_vec());
        Ok(())
    }

    fn load_pending(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.pending(room))
    }

    fn clear_pending(&self, room: &str) -> Result<(), StoreError> {
        if let Some(state) = self.rooms().get_mut(room) {
            state.pending.clear();
        }
        Ok(())
    }
}
