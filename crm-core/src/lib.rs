//! # crm-core: replicated CRM document
//!
//! An operation-based CRDT holding three collections of records
//! (contacts, companies, deals) merged per field with last-write-wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  mutate()   ┌──────────────┐  on_change  ┌──────────────┐
//! │ Transaction  │ ──────────► │  Document    │ ──────────► │  Projector   │
//! │ (typed crm)  │             │  (replica)   │             │  ReadModel   │
//! └──────────────┘             └──────┬───────┘             └──────────────┘
//!                                     │ Update bytes
//!                                     ▼
//!                              persist / transmit
//! ```
//!
//! ## Modules
//!
//! - [`record`]: Field values, collection schema, record codec
//! - [`version`]: Replica ids, stamps, Lamport clock, version state
//! - [`update`]: Update envelope (deltas, diffs, snapshots)
//! - [`document`]: The replicated document and its transactions
//! - [`crm`]: Typed contacts, companies and deals
//! - [`projection`]: Read-model projection

pub mod record;
pub mod version;
pub mod update;
pub mod document;
pub mod crm;
pub mod projection;

pub use record::{
    decode_record, encode_record, CodecError, Collection, EntityId, FieldKind, FieldValue, Record,
};
pub use version::{ReplicaId, Stamp, VersionState};
pub use update::{Op, Update};
pub use document::{ChangeEvent, ChangeOrigin, Committed, Document, ListenerId, Transaction};
pub use crm::{
    Company, CompanyPatch, Contact, ContactPatch, Deal, DealPatch, DealStatus, NewCompany, NewContact, NewDeal,
};
pub use projection::{project, ProjectedEntity, ProjectionHandle, Projector, ReadModel};
