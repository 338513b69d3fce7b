//! Update envelope: the unit of persistence and network transmission.
//!
//! Wire format:
//! ```text
//! ┌─────────┬───────────────────────────────────────────┐
//! │ format  │ bincode(Vec<Op>, Option<VersionState>)     │
//! │ 1 byte  │ variable                                   │
//! └─────────┴───────────────────────────────────────────┘
//! ```
//!
//! A local transaction encodes as ops sharing one stamp and no context.
//! A diff or snapshot carries the sender's version state as context so the
//! receiver learns which transactions the contained state already reflects.

use serde::{Deserialize, Serialize};

use crate::record::{strip_format, validate_field, CodecError, Collection, EntityId, FieldValue, FORMAT_VERSION};
use crate::version::{Stamp, VersionState};

/// One replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Last-write-wins assignment of one field.
    Set {
        collection: Collection,
        entity: EntityId,
        field: String,
        value: FieldValue,
        stamp: Stamp,
    },
    /// Permanent tombstone for an entity.
    Delete {
        collection: Collection,
        entity: EntityId,
        stamp: Stamp,
    },
}

impl Op {
    pub fn stamp(&self) -> &Stamp {
        match self {
            Op::Set { stamp, .. } | Op::Delete { stamp, .. } => stamp,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Op::Set { collection, .. } | Op::Delete { collection, .. } => *collection,
        }
    }

    pub fn entity(&self) -> &EntityId {
        match self {
            Op::Set { entity, .. } | Op::Delete { entity, .. } => entity,
        }
    }
}

/// Decoded form of an update delta or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
    pub context: Option<VersionState>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.context.as_ref().map_or(true, VersionState::is_empty)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode and type-check every field write.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let body = strip_format(bytes)?;
        let (update, read): (Update, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| CodecError::Deserialization(e.to_string()))?;
        if read != body.len() {
            return Err(CodecError::Deserialization(format!(
                "{} trailing bytes after update",
                body.len() - read
            )));
        }
        for op in &update.ops {
            if let Op::Set { collection, field, value, .. } = op {
                validate_field(*collection, field, value)?;
            }
        }
        Ok(update)
    }
}
