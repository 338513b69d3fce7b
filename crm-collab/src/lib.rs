//! # crm-collab: relay, transport and durability for CRM replicas
//!
//! Moves [`crm_core::Document`] updates between replicas through a
//! content-agnostic WebSocket relay, and keeps each replica's state on
//! local disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐     WebSocket     ┌─────────────┐
//! │ Replica X   │ ◄────────────────► │ RelayServer  │ ◄───────────────► │ Replica Y   │
//! │ Document    │   opaque frames    │ room "crm"   │                   │ Document    │
//! │ SyncClient  │                    │ (no state)   │                   │ SyncClient  │
//! └──────┬──────┘                    └──────┬───────┘                   └──────┬──────┘
//!        │                                  │                                  │
//!        ▼                                  ▼                                  ▼
//! ┌─────────────┐                   ┌───────────────┐                  ┌─────────────┐
//! │ Durability  │                   │ BroadcastGroup│                  │ Durability  │
//! │ (RocksDB)   │                   │ per room      │                  │ (memory)    │
//! └─────────────┘                   └───────────────┘                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out with lag detection
//! - [`server`]: WebSocket relay
//! - [`backoff`]: Reconnect delay policy
//! - [`client`]: WebSocket sync client with offline queue
//! - [`storage`]: Snapshot and pending-delta persistence
//! - [`replica`]: Document + transport + durability + projection for one room

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod backoff;
pub mod client;
pub mod storage;
pub mod replica;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncReply};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnId, Frame, RoomManager};
pub use server::{resolve_room, RelayServer, ServerConfig, ServerStats};
pub use backoff::{Backoff, BackoffConfig};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use storage::{
    DocumentStore, Durability, MemoryStore, RoomMetadata, SnapshotStore, StoreConfig, StoreError,
};
pub use replica::Replica;
