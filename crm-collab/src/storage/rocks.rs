//! RocksDB-backed room store.
//!
//! Column families:
//! - `snapshots` : latest exported document per room (LZ4 compressed)
//! - `pending`   : deltas not yet handed to the relay (LZ4 compressed,
//!   keyed by room + sequence number)
//! - `metadata`  : per-room sizes, pending count and timestamps (bincode)
//!
//! Room keys are length-prefixed so that no room name is a key prefix of
//! another room's pending range.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SnapshotStore, StoreError};

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_PENDING: &str = "pending";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PENDING, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crm_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Room metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Deltas currently in the pending log
    pub pending_count: u64,
    /// Sequence number for the next pending delta
    pub next_pending_seq: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = now_secs();
        Self {
            room: room.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            pending_count: 0,
            next_pending_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed store for room snapshots and pending deltas.
///
/// Every write that touches metadata goes through one `WriteBatch`, so a
/// snapshot or a pending delta and its metadata land together or not at all.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::debug!("Opened room store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 frames
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PENDING => {
                // Appended, range-scanned by room, deleted in bulk
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the room's snapshot (LZ4 compressed).
    pub fn save_snapshot(&self, room: &str, snapshot: &[u8]) -> Result<RoomMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(room)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = room_key(room);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load the room's snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, room: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_key(room))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(room.to_string())),
        }
    }

    pub fn room_exists(&self, room: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, room_key(room))?.is_some())
    }

    // ─── Pending deltas ───────────────────────────────────────────────

    /// Append a delta to the room's pending log. Returns its sequence number.
    ///
    /// Key format: `<room key><seq:8 bytes big-endian>`
    pub fn append_pending_delta(&self, room: &str, delta: &[u8]) -> Result<u64, StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(room)?;
        let seq = meta.next_pending_seq;
        meta.next_pending_seq += 1;
        meta.pending_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_pending, pending_key(room, seq), lz4_flex::compress_prepend_size(delta));
        batch.put_cf(&cf_meta, room_key(room), meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    /// All pending deltas for the room in sequence order, decompressed.
    pub fn load_pending_deltas(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let prefix = room_key(room);
        let start = pending_key(room, 0);

        let mut deltas = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            // Stop once past this room's range
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }

            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            let seq = u64::from_be_bytes(seq_buf);

            let delta = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((seq, delta));
        }

        Ok(deltas)
    }

    /// Drop the room's pending log. Returns how many deltas were removed.
    ///
    /// The sequence counter keeps counting so keys are never reused.
    pub fn clear_pending_deltas(&self, room: &str) -> Result<u64, StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = room_key(room);
        let start = pending_key(room, 0);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf_pending, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            batch.delete_cf(&cf_pending, &key);
            count += 1;
        }

        if count > 0 {
            let mut meta = self.metadata_or_new(room)?;
            meta.pending_count = 0;
            meta.updated_at = now_secs();
            batch.put_cf(&cf_meta, &prefix, meta.encode()?);
            self.write(batch)?;
        }

        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_key(room))? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room.to_string())),
        }
    }

    /// List all rooms with stored state.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(RoomMetadata::decode(&value)?.room);
        }
        Ok(rooms)
    }

    /// Delete a room's snapshot, pending log and metadata.
    pub fn delete_room(&self, room: &str) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_pending = self.cf(CF_PENDING)?;
        let key = room_key(room);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, &key);
        batch.delete_cf(&cf_meta, &key);
        batch.delete_range_cf(&cf_pending, pending_key(room, 0), pending_key_end(room));
        self.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn metadata_or_new(&self, room: &str) -> Result<RoomMetadata, StoreError> {
        match self.load_metadata(room) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(RoomMetadata::new(room)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl SnapshotStore for DocumentStore {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.load_snapshot(room) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.save_snapshot(room, snapshot).map(|_| ())
    }

    fn append_pending(&self, room: &str, delta: &[u8]) -> Result<(), StoreError> {
        self.append_pending_delta(room, delta).map(|_| ())
    }

    fn load_pending(&self, room: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .load_pending_deltas(room)?
            .into_iter()
            .map(|(_, delta)| delta)
            .collect())
    }

    fn clear_pending(&self, room: &str) -> Result<(), StoreError> {
        self.clear_pending_deltas(room).map(|_| ())
    }
}

/// `<len:4 bytes big-endian><room utf-8>`
fn room_key(room: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + room.len());
    key.extend_from_slice(&(room.len() as u32).to_be_bytes());
    key.extend_from_slice(room.as_bytes());
    key
}

fn pending_key(room: &str, seq: u64) -> Vec<u8> {
    let mut key = room_key(room);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Exclusive upper bound of the room's pending range.
fn pending_key_end(room: &str) -> Vec<u8> {
    let mut key = room_key(room);
    key.extend_from_slice(&[0xFF; 9]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"contacts companies deals contacts companies deals contacts companies deals".to_vec();

        let meta = store.save_snapshot("crm", &data).unwrap();
        assert_eq!(meta.room, "crm");
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_snapshot("crm").unwrap(), data);
        assert!(store.room_exists("crm").unwrap());
    }

    #[test]
    fn test_snapshot_overwrite() {
        let (_dir, store) = open_temp();
        store.save_snapshot("crm", b"old").unwrap();
        let meta = store.save_snapshot("crm", b"newer").unwrap();
        assert_eq!(meta.snapshot_size, 5);
        assert_eq!(store.load_snapshot("crm").unwrap(), b"newer");
        assert_eq!(store.list_rooms().unwrap(), vec!["crm".to_string()]);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load_snapshot("nope"), Err(StoreError::NotFound("nope".to_string())));
        assert_eq!(SnapshotStore::load(&store, "nope").unwrap(), None);
    }

    #[test]
    fn test_pending_append_load_clear() {
        let (_dir, store) = open_temp();
        for i in 0..5u8 {
            assert_eq!(store.append_pending_delta("crm", &[i; 32]).unwrap(), i as u64);
        }

        let pending = store.load_pending_deltas("crm").unwrap();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0], (0, vec![0; 32]));
        assert_eq!(pending[4], (4, vec![4; 32]));
        assert_eq!(store.load_metadata("crm").unwrap().pending_count, 5);

        assert_eq!(store.clear_pending_deltas("crm").unwrap(), 5);
        assert!(store.load_pending_deltas("crm").unwrap().is_empty());
        let meta = store.load_metadata("crm").unwrap();
        assert_eq!(meta.pending_count, 0);

        // Sequence numbers are not reused after a clear
        assert_eq!(store.append_pending_delta("crm", b"x").unwrap(), 5);
    }

    #[test]
    fn test_prefix_rooms_do_not_collide() {
        let (_dir, store) = open_temp();
        store.append_pending_delta("a", b"in a").unwrap();
        store.append_pending_delta("ab", b"in ab").unwrap();
        store.append_pending_delta("ab", b"in ab 2").unwrap();

        assert_eq!(SnapshotStore::load_pending(&store, "a").unwrap(), vec![b"in a".to_vec()]);
        assert_eq!(store.load_pending_deltas("ab").unwrap().len(), 2);

        assert_eq!(store.clear_pending_deltas("a").unwrap(), 1);
        assert_eq!(store.load_pending_deltas("ab").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_room() {
        let (_dir, store) = open_temp();
        store.save_snapshot("gone", b"s").unwrap();
        store.append_pending_delta("gone", b"d").unwrap();
        store.save_snapshot("kept", b"k").unwrap();

        store.delete_room("gone").unwrap();
        assert!(!store.room_exists("gone").unwrap());
        assert!(store.load_pending_deltas("gone").unwrap().is_empty());
        assert_eq!(store.load_snapshot("kept").unwrap(), b"k");
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot("crm", b"persisted").unwrap();
            store.append_pending_delta("crm", b"unsent").unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_snapshot("crm").unwrap(), b"persisted");
        assert_eq!(store.load_pending_deltas("crm").unwrap(), vec![(0, b"unsent".to_vec())]);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let meta = RoomMetadata::new("crm");
        assert_eq!(RoomMetadata::decode(&meta.encode().unwrap()).unwrap(), meta);
    }
}
