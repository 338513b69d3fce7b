//! Read-model projection: a plain, presentation-ready snapshot of a
//! [`Document`], rebuilt on every change.
//!
//! ```text
//! Document ──on_change──► project() ──► Arc<ReadModel> ──► ProjectionHandle::latest()
//! ```
//!
//! The rebuild is a full scan, linear in the number of live entities.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::crm::{Company, Contact, Deal};
use crate::document::{Document, ListenerId};
use crate::record::{Collection, EntityId, FieldValue, Record};

/// One live entity with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedEntity {
    pub id: EntityId,
    pub record: Record,
}

struct PlainValue<'a>(&'a FieldValue);

impl Serialize for PlainValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Number(n) => serializer.serialize_f64(*n),
            FieldValue::Timestamp(t) => serializer.serialize_i64(*t),
            FieldValue::Reference(id) => serializer.serialize_str(id.as_str()),
        }
    }
}

/// Flat object: `{"id": ..., <field>: <value>, ...}`.
impl Serialize for ProjectedEntity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.record.len() + 1))?;
        map.serialize_entry("id", self.id.as_str())?;
        for (field, value) in self.record.iter() {
            if field == "id" {
                continue;
            }
            map.serialize_entry(field, &PlainValue(value))?;
        }
        map.end()
    }
}

/// Snapshot of all live entities, each collection sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadModel {
    pub contacts: Vec<ProjectedEntity>,
    pub companies: Vec<ProjectedEntity>,
    pub deals: Vec<ProjectedEntity>,
}

impl ReadModel {
    pub fn entities(&self, collection: Collection) -> &[ProjectedEntity] {
        match collection {
            Collection::Contacts => &self.contacts,
            Collection::Companies => &self.companies,
            Collection::Deals => &self.deals,
        }
    }

    pub fn get(&self, collection: Collection, id: &EntityId) -> Option<&Record> {
        let entities = self.entities(collection);
        entities
            .binary_search_by(|e| e.id.cmp(id))
            .ok()
            .map(|i| &entities[i].record)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|e| Contact::from_record(e.id.clone(), &e.record))
            .collect()
    }

    pub fn companies(&self) -> Vec<Company> {
        self.companies
            .iter()
            .map(|e| Company::from_record(e.id.clone(), &e.record))
            .collect()
    }

    pub fn deals(&self) -> Vec<Deal> {
        self.deals
            .iter()
            .map(|e| Deal::from_record(e.id.clone(), &e.record))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len() + self.companies.len() + self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build the read model from the current document state.
pub fn project(doc: &Document) -> ReadModel {
    let collect = |collection: Collection| -> Vec<ProjectedEntity> {
        doc.records(collection)
            .map(|(id, record)| ProjectedEntity {
                id: id.clone(),
                record,
            })
            .collect()
    };
    ReadModel {
        contacts: collect(Collection::Contacts),
        companies: collect(Collection::Companies),
        deals: collect(Collection::Deals),
    }
}

/// Keeps a read model current by listening to a document.
pub struct Projector;

impl Projector {
    /// Project once now and again after every observable change.
    pub fn attach(doc: &mut Document) -> ProjectionHandle {
        let shared = Arc::new(Shared {
            model: RwLock::new(Arc::new(project(doc))),
            version: AtomicU64::new(0),
        });
        let sink = shared.clone();
        let listener = doc.on_change(move |doc, _| {
            sink.publish(project(doc));
        });
        ProjectionHandle { shared, listener }
    }
}

struct Shared {
    model: RwLock<Arc<ReadModel>>,
    version: AtomicU64,
}

impl Shared {
    fn publish(&self, model: ReadModel) {
        let mut slot = self.model.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(model);
        self.version.fetch_add(1, Ordering::Release);
    }
}

/// Cheap to clone; all clones observe the same projection.
#[derive(Clone)]
pub struct ProjectionHandle {
    shared: Arc<Shared>,
    listener: ListenerId,
}

impl ProjectionHandle {
    pub fn latest(&self) -> Arc<ReadModel> {
        self.shared
            .model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of rebuilds since attach.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Stop following `doc`. The last model stays readable.
    pub fn detach(&self, doc: &mut Document) -> bool {
        doc.remove_listener(self.listener)
    }
}

impl std::fmt::Debug for ProjectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandle")
            .field("version", &self.version())
            .field("listener", &self.listener)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{NewCompany, NewContact};

    fn clock() -> i64 {
        7
    }

    #[test]
    fn test_project_skips_tombstones_and_sorts() {
        let mut doc = Document::new().with_time_source(clock);
        let ids = doc
            .mutate(|tx| {
                let a = tx.add_company(NewCompany::new("A"))?;
                let b = tx.add_company(NewCompany::new("B"))?;
                let c = tx.add_company(NewCompany::new("C"))?;
                Ok(vec![a, b, c])
            })
            .unwrap()
            .output;
        doc.mutate(|tx| Ok(tx.remove_company(&ids[1]))).unwrap();

        let model = project(&doc);
        assert_eq!(model.companies.len(), 2);
        assert!(model.companies.windows(2).all(|w| w[0].id < w[1].id));
        assert!(model.get(Collection::Companies, &ids[1]).is_none());
        assert_eq!(
            model.get(Collection::Companies, &ids[0]).and_then(|r| r.text("name")),
            Some("A")
        );
    }

    #[test]
    fn test_flat_json() {
        let mut doc = Document::new().with_time_source(clock);
        let id = doc
            .mutate(|tx| tx.add_contact(NewContact::new("Ann", "Lee")))
            .unwrap()
            .output;
        let json: serde_json::Value = serde_json::from_str(&project(&doc).to_json().unwrap()).unwrap();
        assert_eq!(
            json["contacts"][0],
            serde_json::json!({
                "id": id.as_str(),
                "createdAt": 7,
                "updatedAt": 7,
                "firstName": "Ann",
                "lastName": "Lee",
            })
        );
        assert_eq!(json["deals"], serde_json::json!([]));
    }

    #[test]
    fn test_handle_follows_changes() {
        let mut doc = Document::new().with_time_source(clock);
        let handle = Projector::attach(&mut doc);
        assert!(handle.latest().is_empty());
        assert_eq!(handle.version(), 0);

        doc.mutate(|tx| tx.add_company(NewCompany::new("Acme"))).unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.latest().companies()[0].name, "Acme");

        // No-op transaction, no rebuild.
        doc.mutate(|_| Ok(())).unwrap();
        assert_eq!(handle.version(), 1);

        let before = handle.latest();
        assert!(handle.detach(&mut doc));
        doc.mutate(|tx| tx.add_company(NewCompany::new("Other"))).unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.latest(), before);
    }

    #[test]
    fn test_remote_changes_reach_projection() {
        let mut a = Document::new();
        let mut b = Document::new();
        let handle = Projector::attach(&mut b);

        let update = a
            .mutate(|tx| tx.add_company(NewCompany::new("Acme")))
            .unwrap()
            .update
            .unwrap();
        b.apply(&update).unwrap();
        assert_eq!(handle.latest().companies.len(), 1);
        b.apply(&update).unwrap();
        assert_eq!(handle.version(), 1);
    }
}
