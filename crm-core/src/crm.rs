//! Typed CRM schema on top of the untyped document.
//!
//! `New*` structs describe a fresh entity, `*Patch` structs a partial
//! update, and `Contact`/`Company`/`Deal` are read views built from a
//! projected record. Optional fields are only written when present.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::Transaction;
use crate::record::{CodecError, Collection, EntityId, FieldValue, Record};

type Fields = Vec<(String, FieldValue)>;

fn push(fields: &mut Fields, name: &str, value: impl Into<FieldValue>) {
    fields.push((name.to_string(), value.into()));
}

fn push_opt<V: Into<FieldValue>>(fields: &mut Fields, name: &str, value: Option<V>) {
    if let Some(value) = value {
        push(fields, name, value);
    }
}

/// Lifecycle of a deal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    #[default]
    Open,
    Won,
    Lost,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Open => "open",
            DealStatus::Won => "won",
            DealStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(DealStatus::Open),
            "won" => Ok(DealStatus::Won),
            "lost" => Ok(DealStatus::Lost),
            other => Err(format!("unknown deal status: {other}")),
        }
    }
}

impl From<DealStatus> for FieldValue {
    fn from(status: DealStatus) -> Self {
        FieldValue::Text(status.as_str().to_string())
    }
}

// ─── Inputs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewContact {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_id: Option<EntityId>,
}

impl NewContact {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Default::default()
        }
    }

    fn into_fields(self) -> Fields {
        let mut fields = Vec::with_capacity(5);
        push(&mut fields, "firstName", self.first_name);
        push(&mut fields, "lastName", self.last_name);
        push_opt(&mut fields, "email", self.email);
        push_opt(&mut fields, "phone", self.phone);
        push_opt(&mut fields, "companyId", self.company_id);
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCompany {
    pub name: String,
}

impl NewCompany {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDeal {
    pub title: String,
    pub value: f64,
    pub status: DealStatus,
    pub company_id: Option<EntityId>,
    pub contact_id: Option<EntityId>,
}

impl NewDeal {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    fn into_fields(self) -> Fields {
        let mut fields = Vec::with_capacity(5);
        push(&mut fields, "title", self.title);
        push(&mut fields, "value", self.value);
        push(&mut fields, "status", self.status);
        push_opt(&mut fields, "companyId", self.company_id);
        push_opt(&mut fields, "contactId", self.contact_id);
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_id: Option<EntityId>,
}

impl ContactPatch {
    fn into_fields(self) -> Fields {
        let mut fields = Vec::new();
        push_opt(&mut fields, "firstName", self.first_name);
        push_opt(&mut fields, "lastName", self.last_name);
        push_opt(&mut fields, "email", self.email);
        push_opt(&mut fields, "phone", self.phone);
        push_opt(&mut fields, "companyId", self.company_id);
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanyPatch {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealPatch {
    pub title: Option<String>,
    pub value: Option<f64>,
    pub status: Option<DealStatus>,
    pub company_id: Option<EntityId>,
    pub contact_id: Option<EntityId>,
}

impl DealPatch {
    fn into_fields(self) -> Fields {
        let mut fields = Vec::new();
        push_opt(&mut fields, "title", self.title);
        push_opt(&mut fields, "value", self.value);
        push_opt(&mut fields, "status", self.status);
        push_opt(&mut fields, "companyId", self.company_id);
        push_opt(&mut fields, "contactId", self.contact_id);
        fields
    }
}

// ─── Transaction helpers ──────────────────────────────────────────────

impl Transaction<'_> {
    pub fn add_contact(&mut self, contact: NewContact) -> Result<EntityId, CodecError> {
        self.create(Collection::Contacts, contact.into_fields())
    }

    pub fn add_company(&mut self, company: NewCompany) -> Result<EntityId, CodecError> {
        self.create(Collection::Companies, vec![("name".to_string(), company.name.into())])
    }

    pub fn add_deal(&mut self, deal: NewDeal) -> Result<EntityId, CodecError> {
        self.create(Collection::Deals, deal.into_fields())
    }

    pub fn update_contact(&mut self, id: &EntityId, patch: ContactPatch) -> Result<bool, CodecError> {
        self.update(Collection::Contacts, id, patch.into_fields())
    }

    pub fn update_company(&mut self, id: &EntityId, patch: CompanyPatch) -> Result<bool, CodecError> {
        let mut fields = Vec::new();
        push_opt(&mut fields, "name", patch.name);
        self.update(Collection::Companies, id, fields)
    }

    pub fn update_deal(&mut self, id: &EntityId, patch: DealPatch) -> Result<bool, CodecError> {
        self.update(Collection::Deals, id, patch.into_fields())
    }

    pub fn remove_contact(&mut self, id: &EntityId) -> bool {
        self.delete(Collection::Contacts, id)
    }

    pub fn remove_company(&mut self, id: &EntityId) -> bool {
        self.delete(Collection::Companies, id)
    }

    pub fn remove_deal(&mut self, id: &EntityId) -> bool {
        self.delete(Collection::Deals, id)
    }
}

// ─── Views ────────────────────────────────────────────────────────────

fn text(record: &Record, field: &str) -> String {
    record.text(field).unwrap_or_default().to_string()
}

fn opt_text(record: &Record, field: &str) -> Option<String> {
    record.text(field).map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: EntityId,
    pub created_at: i64,
    pub updated_at: i64,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<EntityId>,
}

impl Contact {
    pub fn from_record(id: EntityId, record: &Record) -> Self {
        Self {
            id,
            created_at: record.created_at().unwrap_or_default(),
            updated_at: record.updated_at().unwrap_or_default(),
            first_name: text(record, "firstName"),
            last_name: text(record, "lastName"),
            email: opt_text(record, "email"),
            phone: opt_text(record, "phone"),
            company_id: record.reference("companyId").cloned(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: EntityId,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
}

impl Company {
    pub fn from_record(id: EntityId, record: &Record) -> Self {
        Self {
            id,
            created_at: record.created_at().unwrap_or_default(),
            updated_at: record.updated_at().unwrap_or_default(),
            name: text(record, "name"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: EntityId,
    pub created_at: i64,
    pub updated_at: i64,
    pub title: String,
    pub value: f64,
    pub status: DealStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<EntityId>,
}

impl Deal {
    /// Unknown status strings read as `Open`.
    pub fn from_record(id: EntityId, record: &Record) -> Self {
        Self {
            id,
            created_at: record.created_at().unwrap_or_default(),
            updated_at: record.updated_at().unwrap_or_default(),
            title: text(record, "title"),
            value: record.number("value").unwrap_or_default(),
            status: record
                .text("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            company_id: record.reference("companyId").cloned(),
            contact_id: record.reference("contactId").cloned(),
        }
    }
}
