//! Record codec: typed field values, per-collection field schema, and the
//! binary form of a single entity's field set.
//!
//! Wire format of an encoded record:
//! ```text
//! ┌─────────┬──────────────────────────────────────┐
//! │ format  │ bincode(BTreeMap<String, FieldValue>) │
//! │ 1 byte  │ variable                              │
//! └─────────┴──────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current record/update encoding version.
pub const FORMAT_VERSION: u8 = 1;

/// System field: creation time in milliseconds since epoch.
pub const CREATED_AT: &str = "createdAt";
/// System field: last modification time in milliseconds since epoch.
pub const UPDATED_AT: &str = "updatedAt";

/// Opaque, globally unique entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a fresh identifier from a random (v4) UUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three replicated collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    Contacts,
    Companies,
    Deals,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Contacts, Collection::Companies, Collection::Deals];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Contacts => "contacts",
            Collection::Companies => "companies",
            Collection::Deals => "deals",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    /// Milliseconds since epoch
    Timestamp(i64),
    /// Id of another entity
    Reference(EntityId),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Timestamp(_) => FieldKind::Timestamp,
            FieldValue::Reference(_) => FieldKind::Reference,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&EntityId> {
        match self {
            FieldValue::Reference(id) => Some(id),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<EntityId> for FieldValue {
    fn from(id: EntityId) -> Self {
        FieldValue::Reference(id)
    }
}

/// Discriminant of [`FieldValue`], used by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Timestamp,
    Reference,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// Declared kind of a field, or `None` for fields outside the schema.
pub fn field_kind(collection: Collection, field: &str) -> Option<FieldKind> {
    if is_system_field(field) {
        return Some(FieldKind::Timestamp);
    }
    match (collection, field) {
        (Collection::Contacts, "firstName" | "lastName" | "email" | "phone") => Some(FieldKind::Text),
        (Collection::Contacts, "companyId") => Some(FieldKind::Reference),
        (Collection::Companies, "name") => Some(FieldKind::Text),
        (Collection::Deals, "title" | "status") => Some(FieldKind::Text),
        (Collection::Deals, "value") => Some(FieldKind::Number),
        (Collection::Deals, "companyId" | "contactId") => Some(FieldKind::Reference),
        _ => None,
    }
}

pub fn is_system_field(field: &str) -> bool {
    field == CREATED_AT || field == UPDATED_AT
}

/// Check a value against the collection schema.
///
/// Undeclared fields accept any kind.
pub fn validate_field(collection: Collection, field: &str, value: &FieldValue) -> Result<(), CodecError> {
    if field.is_empty() {
        return Err(CodecError::EmptyFieldName);
    }
    match field_kind(collection, field) {
        Some(expected) if expected != value.kind() => Err(CodecError::FieldType {
            collection,
            field: field.to_string(),
            expected,
            got: value.kind(),
        }),
        _ => Ok(()),
    }
}

/// Like [`validate_field`], and additionally rejects system fields.
///
/// Callers never write `createdAt`/`updatedAt` directly.
pub fn validate_user_field(collection: Collection, field: &str, value: &FieldValue) -> Result<(), CodecError> {
    if is_system_field(field) {
        return Err(CodecError::ReservedField(field.to_string()));
    }
    validate_field(collection, field, value)
}

/// One entity's field set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(field.into(), value)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_number)
    }

    pub fn reference(&self, field: &str) -> Option<&EntityId> {
        self.get(field).and_then(FieldValue::as_reference)
    }

    pub fn created_at(&self) -> Option<i64> {
        self.get(CREATED_AT).and_then(FieldValue::as_timestamp)
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.get(UPDATED_AT).and_then(FieldValue::as_timestamp)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn into_fields(self) -> BTreeMap<String, FieldValue> {
        self.fields
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Encode a record to its storage/wire form.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a record and validate every field against the collection schema.
pub fn decode_record(collection: Collection, bytes: &[u8]) -> Result<Record, CodecError> {
    let body = strip_format(bytes)?;
    let (record, _): (Record, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| CodecError::Deserialization(e.to_string()))?;
    for (field, value) in record.iter() {
        validate_field(collection, field, value)?;
    }
    Ok(record)
}

/// Split off and check the leading format byte.
pub(crate) fn strip_format(bytes: &[u8]) -> Result<&[u8], CodecError> {
    match bytes.split_first() {
        Some((&FORMAT_VERSION, rest)) => Ok(rest),
        Some((&other, _)) => Err(CodecError::UnsupportedVersion(other)),
        None => Err(CodecError::Empty),
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    Empty,
    UnsupportedVersion(u8),
    Serialization(String),
    Deserialization(String),
    EmptyFieldName,
    ReservedField(String),
    FieldType {
        collection: Collection,
        field: String,
        expected: FieldKind,
        got: FieldKind,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty input"),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported encoding version: {v}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::EmptyFieldName => write!(f, "Field name must not be empty"),
            Self::ReservedField(name) => write!(f, "Field '{name}' is managed by the document"),
            Self::FieldType {
                collection,
                field,
                expected,
                got,
            } => write!(f, "{collection}.{field} expects {expected}, got {got}"),
        }
    }
}

impl std::error::Error for CodecError {}
