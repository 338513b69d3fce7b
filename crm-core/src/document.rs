//! Replicated document: collections of records merged per field with
//! last-write-wins and permanent entity tombstones.
//!
//! ```text
//! mutate(fn) ──► Transaction ──► commit ──► Update bytes ──┬─► listeners
//!                                                          └─► caller (persist / send)
//! apply(bytes) ──► decode ──► skip covered ops ──► integrate ──► listeners (if changed)
//! ```
//!
//! Merge rule: for each `(collection, entity, field)` the write with the
//! greatest [`Stamp`] wins. A tombstone drops every field of its entity and
//! discards any later write to it, so deleted entities never come back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::record::{
    decode_record, encode_record, is_system_field, validate_user_field, CodecError, Collection, EntityId,
    FieldValue, Record, CREATED_AT, UPDATED_AT,
};
use crate::update::{Op, Update};
use crate::version::{LamportClock, ReplicaId, Stamp, VersionState};

pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&Document, &ChangeEvent<'_>) + Send>;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Snapshot,
}

/// Passed to listeners after every observable change.
#[derive(Debug)]
pub struct ChangeEvent<'a> {
    pub origin: ChangeOrigin,
    /// The encoded update that caused the change
    pub update: &'a [u8],
}

/// Result of a committed transaction.
#[derive(Debug)]
pub struct Committed<R> {
    pub output: R,
    /// `None` when the transaction wrote nothing
    pub update: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Register {
    value: FieldValue,
    stamp: Stamp,
}

#[derive(Debug, Clone, Default)]
struct EntityState {
    fields: BTreeMap<String, Register>,
    tombstone: Option<Stamp>,
}

impl EntityState {
    fn is_live(&self) -> bool {
        self.tombstone.is_none() && !self.fields.is_empty()
    }

    fn record(&self) -> Record {
        self.fields
            .iter()
            .map(|(name, reg)| (name.clone(), reg.value.clone()))
            .collect()
    }
}

fn system_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One replica of the shared CRM state.
pub struct Document {
    replica: ReplicaId,
    clock: LamportClock,
    /// Last local transaction sequence number
    seq: u64,
    collections: BTreeMap<Collection, BTreeMap<EntityId, EntityState>>,
    version: VersionState,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
    now: fn() -> i64,
}

impl Document {
    /// Empty document with a fresh replica id.
    pub fn new() -> Self {
        Self::with_replica(ReplicaId::random())
    }

    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: LamportClock::default(),
            seq: 0,
            collections: BTreeMap::new(),
            version: VersionState::new(),
            listeners: Vec::new(),
            next_listener: 0,
            now: system_time_ms,
        }
    }

    /// Replace the wall clock used for `createdAt`/`updatedAt`.
    pub fn with_time_source(mut self, now: fn() -> i64) -> Self {
        self.now = now;
        self
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn version_state(&self) -> &VersionState {
        &self.version
    }

    /// Encoded version state, sent as the first handshake step.
    pub fn state_vector(&self) -> Result<Vec<u8>, CodecError> {
        self.version.encode()
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Run a batch of writes as one transaction.
    ///
    /// Produces exactly one update when anything was written and notifies
    /// listeners once. If `f` returns an error nothing is committed.
    pub fn mutate<F, R>(&mut self, f: F) -> Result<Committed<R>, CodecError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, CodecError>,
    {
        let (output, writes) = {
            let mut txn = Transaction::new(self);
            let output = f(&mut txn)?;
            (output, txn.writes)
        };
        if writes.is_empty() {
            return Ok(Committed { output, update: None });
        }

        let stamp = Stamp {
            lamport: self.clock.current() + 1,
            replica: self.replica,
            seq: self.seq + 1,
        };
        let update = Update {
            ops: writes.into_ops(stamp),
            context: None,
        };
        let bytes = update.encode()?;

        self.clock.tick();
        self.seq = stamp.seq;
        for op in &update.ops {
            self.integrate(op);
        }
        self.version.insert(stamp.replica, stamp.seq);

        log::trace!(
            "Replica {} committed {} ops at lamport {}",
            self.replica,
            update.ops.len(),
            stamp.lamport
        );
        self.notify(ChangeOrigin::Local, &bytes);
        Ok(Committed {
            output,
            update: Some(bytes),
        })
    }

    // ─── Merge ────────────────────────────────────────────────────────

    /// Merge a remote update. Idempotent and commutative.
    ///
    /// Returns whether observable state changed; listeners run only then.
    pub fn apply(&mut self, update: &[u8]) -> Result<bool, CodecError> {
        self.apply_with_origin(update, ChangeOrigin::Remote)
    }

    /// Merge a full snapshot produced by [`export_snapshot`](Self::export_snapshot).
    pub fn import_snapshot(&mut self, snapshot: &[u8]) -> Result<bool, CodecError> {
        self.apply_with_origin(snapshot, ChangeOrigin::Snapshot)
    }

    fn apply_with_origin(&mut self, bytes: &[u8], origin: ChangeOrigin) -> Result<bool, CodecError> {
        let update = Update::decode(bytes)?;

        let mut changed = false;
        let mut seen = Vec::new();
        for op in &update.ops {
            let stamp = *op.stamp();
            if self.version.covers(&stamp) {
                continue;
            }
            changed |= self.integrate(op);
            seen.push(stamp);
        }
        // Ops of one transaction share a stamp; record them after the loop.
        for stamp in seen {
            self.version.insert(stamp.replica, stamp.seq);
        }
        if let Some(context) = &update.context {
            self.version.merge(context);
        }
        self.seq = self.seq.max(self.version.max_seq(self.replica));

        if changed {
            self.notify(origin, bytes);
        }
        Ok(changed)
    }

    /// Merge one op into state. Returns whether a live value changed.
    fn integrate(&mut self, op: &Op) -> bool {
        self.clock.observe(op.stamp().lamport);
        let entity = self
            .collections
            .entry(op.collection())
            .or_default()
            .entry(op.entity().clone())
            .or_default();

        match op {
            Op::Set { field, value, stamp, .. } => {
                if entity.tombstone.is_some() {
                    return false;
                }
                match entity.fields.get_mut(field) {
                    Some(reg) if *stamp <= reg.stamp => false,
                    Some(reg) => {
                        let changed = reg.value != *value;
                        reg.value = value.clone();
                        reg.stamp = *stamp;
                        changed
                    }
                    None => {
                        entity.fields.insert(
                            field.clone(),
                            Register {
                                value: value.clone(),
                                stamp: *stamp,
                            },
                        );
                        true
                    }
                }
            }
            Op::Delete { stamp, .. } => {
                let was_live = entity.is_live();
                entity.tombstone = Some(entity.tombstone.map_or(*stamp, |t| t.max(*stamp)));
                entity.fields.clear();
                was_live
            }
        }
    }

    // ─── Exchange ─────────────────────────────────────────────────────

    /// Everything `remote` has not seen, with our version state as context.
    pub fn diff(&self, remote: &VersionState) -> Result<Vec<u8>, CodecError> {
        let mut ops = Vec::new();
        for (collection, entities) in &self.collections {
            for (id, entity) in entities {
                if let Some(tombstone) = entity.tombstone {
                    if !remote.covers(&tombstone) {
                        ops.push(Op::Delete {
                            collection: *collection,
                            entity: id.clone(),
                            stamp: tombstone,
                        });
                    }
                    continue;
                }
                for (field, reg) in &entity.fields {
                    if !remote.covers(&reg.stamp) {
                        ops.push(Op::Set {
                            collection: *collection,
                            entity: id.clone(),
                            field: field.clone(),
                            value: reg.value.clone(),
                            stamp: reg.stamp,
                        });
                    }
                }
            }
        }
        Update {
            ops,
            context: Some(self.version.clone()),
        }
        .encode()
    }

    /// [`diff`](Self::diff) against an encoded remote state vector.
    pub fn diff_encoded(&self, remote_state: &[u8]) -> Result<Vec<u8>, CodecError> {
        let remote = VersionState::decode(remote_state)?;
        self.diff(&remote)
    }

    /// Complete encoded state.
    ///
    /// Carries no replica identity or clock, so replicas that saw the same
    /// updates export identical bytes.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, CodecError> {
        self.diff(&VersionState::new())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, collection: Collection, id: &EntityId) -> Option<Record> {
        self.entity(collection, id)
            .filter(|e| e.is_live())
            .map(EntityState::record)
    }

    /// One live entity in record-codec form, for handing a single entity
    /// to another document or system.
    pub fn export_record(&self, collection: Collection, id: &EntityId) -> Result<Option<Vec<u8>>, CodecError> {
        self.get(collection, id).map(|record| encode_record(&record)).transpose()
    }

    pub fn contains(&self, collection: Collection, id: &EntityId) -> bool {
        self.entity(collection, id).is_some_and(EntityState::is_live)
    }

    pub fn is_deleted(&self, collection: Collection, id: &EntityId) -> bool {
        self.entity(collection, id)
            .is_some_and(|e| e.tombstone.is_some())
    }

    /// Live entities of a collection, ordered by id.
    pub fn records(&self, collection: Collection) -> impl Iterator<Item = (&EntityId, Record)> + '_ {
        self.collections
            .get(&collection)
            .into_iter()
            .flat_map(|entities| entities.iter())
            .filter(|(_, e)| e.is_live())
            .map(|(id, e)| (id, e.record()))
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .get(&collection)
            .map_or(0, |entities| entities.values().filter(|e| e.is_live()).count())
    }

    pub fn tombstone_count(&self) -> usize {
        self.collections
            .values()
            .flat_map(|entities| entities.values())
            .filter(|e| e.tombstone.is_some())
            .count()
    }

    fn entity(&self, collection: Collection, id: &EntityId) -> Option<&EntityState> {
        self.collections.get(&collection).and_then(|entities| entities.get(id))
    }

    // ─── Listeners ────────────────────────────────────────────────────

    /// Register a callback run after every observable change.
    pub fn on_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Document, &ChangeEvent<'_>) + Send + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn notify(&mut self, origin: ChangeOrigin, update: &[u8]) {
        let mut listeners = std::mem::take(&mut self.listeners);
        let event = ChangeEvent { origin, update };
        for (_, listener) in listeners.iter_mut() {
            listener(self, &event);
        }
        self.listeners = listeners;
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("replica", &self.replica)
            .field("lamport", &self.clock.current())
            .field("seq", &self.seq)
            .field("contacts", &self.len(Collection::Contacts))
            .field("companies", &self.len(Collection::Companies))
            .field("deals", &self.len(Collection::Deals))
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Writes buffered by a transaction, coalesced per field.
#[derive(Debug, Default)]
struct Writes {
    sets: BTreeMap<(Collection, EntityId), BTreeMap<String, FieldValue>>,
    deletes: BTreeSet<(Collection, EntityId)>,
}

impl Writes {
    fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }

    fn into_ops(self, stamp: Stamp) -> Vec<Op> {
        let mut ops = Vec::new();
        for ((collection, entity), fields) in self.sets {
            for (field, value) in fields {
                ops.push(Op::Set {
                    collection,
                    entity: entity.clone(),
                    field,
                    value,
                    stamp,
                });
            }
        }
        for (collection, entity) in self.deletes {
            ops.push(Op::Delete {
                collection,
                entity,
                stamp,
            });
        }
        ops
    }
}

/// A batch of writes against one [`Document`].
///
/// Reads see committed state overlaid with this transaction's own writes.
pub struct Transaction<'doc> {
    doc: &'doc Document,
    now: i64,
    writes: Writes,
}

impl<'doc> Transaction<'doc> {
    fn new(doc: &'doc Document) -> Self {
        Self {
            doc,
            now: (doc.now)(),
            writes: Writes::default(),
        }
    }

    /// Wall-clock time used for this transaction's system fields.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Create an entity with a fresh id; sets `createdAt` and `updatedAt`.
    pub fn create<I>(&mut self, collection: Collection, fields: I) -> Result<EntityId, CodecError>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let fields = Self::validated(collection, fields)?;
        let id = EntityId::generate();
        let pending = self.writes.sets.entry((collection, id.clone())).or_default();
        pending.insert(CREATED_AT.to_string(), FieldValue::Timestamp(self.now));
        pending.insert(UPDATED_AT.to_string(), FieldValue::Timestamp(self.now));
        pending.extend(fields);
        Ok(id)
    }

    /// Create an entity from record-codec bytes.
    ///
    /// The record is validated against the collection schema. Its system
    /// fields are dropped; the new entity gets this transaction's timestamps.
    pub fn import_record(&mut self, collection: Collection, bytes: &[u8]) -> Result<EntityId, CodecError> {
        let record = decode_record(collection, bytes)?;
        let fields = record.into_iter().filter(|(field, _)| !is_system_field(field));
        self.create(collection, fields)
    }

    /// Patch an existing entity and bump `updatedAt`.
    ///
    /// Returns `false` (writing nothing) if the entity is absent or deleted.
    pub fn update<I>(&mut self, collection: Collection, id: &EntityId, patch: I) -> Result<bool, CodecError>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let patch = Self::validated(collection, patch)?;
        if !self.exists(collection, id) {
            return Ok(false);
        }
        let previous = self
            .get(collection, id)
            .and_then(|r| r.updated_at())
            .unwrap_or(i64::MIN);
        let updated_at = self.now.max(previous);

        let pending = self.writes.sets.entry((collection, id.clone())).or_default();
        pending.extend(patch);
        pending.insert(UPDATED_AT.to_string(), FieldValue::Timestamp(updated_at));
        Ok(true)
    }

    /// Delete an entity. Returns `false` if it was not live.
    pub fn delete(&mut self, collection: Collection, id: &EntityId) -> bool {
        if !self.exists(collection, id) {
            return false;
        }
        let key = (collection, id.clone());
        self.writes.sets.remove(&key);
        self.writes.deletes.insert(key);
        true
    }

    pub fn exists(&self, collection: Collection, id: &EntityId) -> bool {
        let key = (collection, id.clone());
        if self.writes.deletes.contains(&key) {
            return false;
        }
        self.writes.sets.contains_key(&key) || self.doc.contains(collection, id)
    }

    pub fn get(&self, collection: Collection, id: &EntityId) -> Option<Record> {
        if !self.exists(collection, id) {
            return None;
        }
        let mut record = self.doc.get(collection, id).unwrap_or_default();
        if let Some(pending) = self.writes.sets.get(&(collection, id.clone())) {
            for (field, value) in pending {
                record.insert(field.clone(), value.clone());
            }
        }
        Some(record)
    }

    fn validated<I>(collection: Collection, fields: I) -> Result<Vec<(String, FieldValue)>, CodecError>
    where
        I: IntoIterator<Item = (String, FieldValue)>,
    {
        let fields: Vec<(String, FieldValue)> = fields.into_iter().collect();
        for (field, value) in &fields {
            validate_user_field(collection, field, value)?;
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fixed_clock() -> i64 {
        1_000
    }

    fn doc() -> Document {
        Document::new().with_time_source(fixed_clock)
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, FieldValue)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    fn add_company(doc: &mut Document, name: &str) -> (EntityId, Vec<u8>) {
        let committed = doc
            .mutate(|tx| tx.create(Collection::Companies, fields(&[("name", name)])))
            .unwrap();
        (committed.output, committed.update.unwrap())
    }

    #[test]
    fn test_mutate_produces_one_update_and_one_notification() {
        let mut doc = doc();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        doc.on_change(move |_, event| {
            assert_eq!(event.origin, ChangeOrigin::Local);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let committed = doc
            .mutate(|tx| {
                let a = tx.create(Collection::Contacts, fields(&[("firstName", "Ann"), ("lastName", "Lee")]))?;
                let b = tx.create(Collection::Companies, fields(&[("name", "Acme")]))?;
                Ok((a, b))
            })
            .unwrap();

        assert!(committed.update.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (contact, company) = committed.output;
        let record = doc.get(Collection::Contacts, &contact).unwrap();
        assert_eq!(record.text("firstName"), Some("Ann"));
        assert_eq!(record.created_at(), Some(1_000));
        assert_eq!(record.updated_at(), Some(1_000));
        assert!(doc.contains(Collection::Companies, &company));

        let update = Update::decode(committed.update.as_ref().unwrap()).unwrap();
        let stamps: BTreeSet<Stamp> = update.ops.iter().map(|op| *op.stamp()).collect();
        assert_eq!(stamps.len(), 1, "one transaction, one stamp");
    }

    #[test]
    fn test_empty_transaction_commits_nothing() {
        let mut doc = doc();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        doc.on_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let missing = EntityId::from("missing");
        let committed = doc
            .mutate(|tx| tx.update(Collection::Contacts, &missing, fields(&[("email", "a@b.c")])))
            .unwrap();
        assert!(!committed.output);
        assert!(committed.update.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut doc = doc();
        let result = doc.mutate(|tx| {
            tx.create(Collection::Companies, fields(&[("name", "Acme")]))?;
            tx.create(Collection::Deals, vec![("value".to_string(), FieldValue::from("many"))])
        });
        assert!(matches!(result, Err(CodecError::FieldType { .. })));
        assert_eq!(doc.len(Collection::Companies), 0);
        assert!(doc.version_state().is_empty());
    }

    #[test]
    fn test_callers_cannot_write_system_fields() {
        let mut doc = doc();
        let result = doc.mutate(|tx| {
            tx.create(
                Collection::Companies,
                vec![(CREATED_AT.to_string(), FieldValue::Timestamp(5))],
            )
        });
        assert_eq!(result.err(), Some(CodecError::ReservedField(CREATED_AT.to_string())));
    }

    #[test]
    fn test_apply_is_idempotent_and_silent_on_duplicates() {
        let mut a = doc();
        let (id, update) = add_company(&mut a, "Acme");

        let mut b = doc();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        b.on_change(move |_, event| {
            assert_eq!(event.origin, ChangeOrigin::Remote);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(b.apply(&update).unwrap());
        let once = b.export_snapshot().unwrap();
        assert!(!b.apply(&update).unwrap());
        assert_eq!(b.export_snapshot().unwrap(), once);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.get(Collection::Companies, &id).unwrap().text("name"), Some("Acme"));
    }

    #[test]
    fn test_concurrent_writes_converge_by_stamp() {
        let mut a = doc();
        let (id, create) = add_company(&mut a, "Acme");
        let mut b = doc();
        b.apply(&create).unwrap();

        let ua = a
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "Acme Corp")])))
            .unwrap()
            .update
            .unwrap();
        let ub = b
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "ACME Inc")])))
            .unwrap()
            .update
            .unwrap();

        a.apply(&ub).unwrap();
        b.apply(&ua).unwrap();
        assert_eq!(a.export_snapshot().unwrap(), b.export_snapshot().unwrap());

        // Same lamport on both sides: the greater replica id wins.
        let expected = if a.replica_id() > b.replica_id() { "Acme Corp" } else { "ACME Inc" };
        assert_eq!(a.get(Collection::Companies, &id).unwrap().text("name"), Some(expected));
    }

    #[test]
    fn test_causally_later_write_wins() {
        let mut a = doc();
        let (id, create) = add_company(&mut a, "Acme");
        let mut b = doc();
        b.apply(&create).unwrap();

        let first = a
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "First")])))
            .unwrap()
            .update
            .unwrap();
        b.apply(&first).unwrap();
        let second = b
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "Second")])))
            .unwrap()
            .update
            .unwrap();

        let mut c = doc();
        c.apply(&second).unwrap();
        c.apply(&first).unwrap();
        c.apply(&create).unwrap();
        assert_eq!(c.get(Collection::Companies, &id).unwrap().text("name"), Some("Second"));
    }

    #[test]
    fn test_tombstone_beats_concurrent_update() {
        let mut a = doc();
        let (id, create) = add_company(&mut a, "Acme");
        let mut b = doc();
        b.apply(&create).unwrap();

        let delete = a
            .mutate(|tx| Ok(tx.delete(Collection::Companies, &id)))
            .unwrap()
            .update
            .unwrap();
        let edit = b
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "Still here")])))
            .unwrap()
            .update
            .unwrap();

        a.apply(&edit).unwrap();
        b.apply(&delete).unwrap();
        assert!(!a.contains(Collection::Companies, &id));
        assert!(!b.contains(Collection::Companies, &id));
        assert!(b.is_deleted(Collection::Companies, &id));
        assert_eq!(a.export_snapshot().unwrap(), b.export_snapshot().unwrap());
    }

    #[test]
    fn test_deleted_entity_rejects_updates() {
        let mut doc = doc();
        let (id, _) = add_company(&mut doc, "Acme");
        doc.mutate(|tx| Ok(tx.delete(Collection::Companies, &id))).unwrap();

        let committed = doc
            .mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "x")])))
            .unwrap();
        assert!(!committed.output);
        assert_eq!(doc.tombstone_count(), 1);
        assert_eq!(doc.records(Collection::Companies).count(), 0);
    }

    #[test]
    fn test_delete_inside_creating_transaction() {
        let mut doc = doc();
        let committed = doc
            .mutate(|tx| {
                let id = tx.create(Collection::Companies, fields(&[("name", "Temp")]))?;
                assert!(tx.exists(Collection::Companies, &id));
                assert!(tx.delete(Collection::Companies, &id));
                assert!(tx.get(Collection::Companies, &id).is_none());
                Ok(id)
            })
            .unwrap();
        assert!(doc.is_deleted(Collection::Companies, &committed.output));
    }

    #[test]
    fn test_updated_at_never_decreases() {
        fn later() -> i64 {
            5_000
        }
        fn earlier() -> i64 {
            2_000
        }

        let mut a = Document::new().with_time_source(later);
        let (id, create) = add_company(&mut a, "Acme");

        let mut b = Document::new().with_time_source(earlier);
        b.apply(&create).unwrap();
        b.mutate(|tx| tx.update(Collection::Companies, &id, fields(&[("name", "Acme 2")])))
            .unwrap();

        let record = b.get(Collection::Companies, &id).unwrap();
        assert_eq!(record.updated_at(), Some(5_000));
        assert_eq!(record.created_at(), Some(5_000));
    }

    #[test]
    fn test_transaction_reads_own_writes() {
        let mut doc = doc();
        let (id, _) = add_company(&mut doc, "Acme");
        doc.mutate(|tx| {
            tx.update(Collection::Companies, &id, fields(&[("name", "Renamed")]))?;
            let seen = tx.get(Collection::Companies, &id).unwrap();
            assert_eq!(seen.text("name"), Some("Renamed"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut a = doc();
        let (id, _) = add_company(&mut a, "Acme");
        let (gone, _) = add_company(&mut a, "Gone");
        a.mutate(|tx| Ok(tx.delete(Collection::Companies, &gone))).unwrap();

        let snapshot = a.export_snapshot().unwrap();
        let mut b = doc();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        b.on_change(move |_, event| {
            assert_eq!(event.origin, ChangeOrigin::Snapshot);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(b.import_snapshot(&snapshot).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(b.contains(Collection::Companies, &id));
        assert!(b.is_deleted(Collection::Companies, &gone));
        assert_eq!(b.version_state(), a.version_state());
        assert_eq!(b.export_snapshot().unwrap(), snapshot);
    }

    #[test]
    fn test_diff_sends_only_missing_state() {
        let mut a = doc();
        let (first, u1) = add_company(&mut a, "First");
        let mut b = doc();
        b.apply(&u1).unwrap();

        let (second, _) = add_company(&mut a, "Second");
        let diff = a.diff_encoded(&b.state_vector().unwrap()).unwrap();
        let decoded = Update::decode(&diff).unwrap();
        assert!(decoded.ops.iter().all(|op| op.entity() == &second));

        b.apply(&diff).unwrap();
        assert!(b.contains(Collection::Companies, &first));
        assert!(b.contains(Collection::Companies, &second));
        assert_eq!(b.version_state(), a.version_state());

        let nothing = a.diff(b.version_state()).unwrap();
        assert!(Update::decode(&nothing).unwrap().ops.is_empty());
    }

    #[test]
    fn test_local_seq_continues_after_importing_own_history() {
        let replica = ReplicaId::random();
        let mut a = Document::with_replica(replica);
        add_company(&mut a, "Acme");
        let snapshot = a.export_snapshot().unwrap();

        let mut restored = Document::with_replica(replica);
        restored.import_snapshot(&snapshot).unwrap();
        let (_, update) = add_company(&mut restored, "Next");
        let stamp = *Update::decode(&update).unwrap().ops[0].stamp();
        assert_eq!(stamp.seq, 2);
        assert!(stamp.lamport > 1);
    }

    #[test]
    fn test_malformed_update_is_rejected_without_side_effects() {
        let mut doc = doc();
        assert!(doc.apply(&[1, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(doc.apply(&[]).is_err());
        assert!(matches!(doc.apply(&[42]), Err(CodecError::UnsupportedVersion(42))));
        assert!(doc.version_state().is_empty());
    }

    #[test]
    fn test_remove_listener() {
        let mut doc = doc();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = doc.on_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        add_company(&mut doc, "One");
        assert!(doc.remove_listener(id));
        assert!(!doc.remove_listener(id));
        add_company(&mut doc, "Two");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_sees_post_change_state() {
        let mut doc = doc();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        doc.on_change(move |doc, _| {
            sink.store(doc.len(Collection::Companies), Ordering::SeqCst);
        });
        add_company(&mut doc, "One");
        add_company(&mut doc, "Two");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_record_export_import_between_documents() {
        let mut source = Document::new().with_time_source(|| 1_000);
        let (acme, _) = add_company(&mut source, "Acme");
        let bytes = source.export_record(Collection::Companies, &acme).unwrap().unwrap();

        let mut target = Document::new().with_time_source(|| 5_000);
        let copy = target
            .mutate(|tx| tx.import_record(Collection::Companies, &bytes))
            .unwrap()
            .output;

        assert_ne!(copy, acme);
        let record = target.get(Collection::Companies, &copy).unwrap();
        assert_eq!(record.text("name"), Some("Acme"));
        assert_eq!(record.created_at(), Some(5_000));
        assert_eq!(record.updated_at(), Some(5_000));
    }

    #[test]
    fn test_export_record_skips_deleted_and_unknown() {
        let mut doc = Document::new();
        let (acme, _) = add_company(&mut doc, "Acme");
        doc.mutate(|tx| Ok(tx.delete(Collection::Companies, &acme))).unwrap();

        assert_eq!(doc.export_record(Collection::Companies, &acme).unwrap(), None);
        assert_eq!(doc.export_record(Collection::Deals, &EntityId::generate()).unwrap(), None);
    }

    #[test]
    fn test_import_record_rejects_schema_mismatch() {
        let mut doc = Document::new();
        let record: Record = [("value".to_string(), FieldValue::Text("lots".into()))]
            .into_iter()
            .collect();
        let bytes = encode_record(&record).unwrap();

        let result = doc.mutate(|tx| tx.import_record(Collection::Deals, &bytes));
        assert!(matches!(result, Err(CodecError::FieldType { .. })));
        assert_eq!(doc.len(Collection::Deals), 0);
    }
}
