//! Cached resource types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{ItemPatch, ListPatch, OperationPayload, ResourceKind};
use crate::remote::RemoteRecord;

/// Prefix of ids assigned locally before the remote confirms a create
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Fields of a list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFields {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ListFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn apply(&mut self, patch: &ListPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
    }
}

/// Fields of an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFields {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub order: i64,
}

fn default_quantity() -> u32 {
    1
}

impl Default for ItemFields {
    fn default() -> Self {
        Self {
            name: String::new(),
            quantity: default_quantity(),
            completed: false,
            description: String::new(),
            order: 0,
        }
    }
}

impl ItemFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, patch: &ItemPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(order) = patch.order {
            self.order = order;
        }
    }
}

/// Resource-specific fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceData {
    List(ListFields),
    Item(ItemFields),
}

impl ResourceData {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceData::List(_) => ResourceKind::List,
            ResourceData::Item(_) => ResourceKind::Item,
        }
    }

    /// Apply an update or create payload; other payloads leave the data untouched.
    ///
    /// Returns false when the payload does not fit this resource kind.
    pub fn apply(&mut self, payload: &OperationPayload) -> bool {
        match (self, payload) {
            (ResourceData::List(fields), OperationPayload::UpdateList(patch)) => {
                fields.apply(patch);
                true
            }
            (ResourceData::Item(fields), OperationPayload::UpdateItem(patch)) => {
                fields.apply(patch);
                true
            }
            (ResourceData::List(fields), OperationPayload::CreateList(created)) => {
                *fields = created.clone();
                true
            }
            (ResourceData::Item(fields), OperationPayload::CreateItem(created)) => {
                *fields = created.clone();
                true
            }
            _ => false,
        }
    }

    /// Names of the semantic fields that differ between two values
    pub fn differing_fields(&self, other: &ResourceData) -> Vec<&'static str> {
        let mut fields = Vec::new();
        match (self, other) {
            (ResourceData::List(a), ResourceData::List(b)) => {
                if a.name != b.name {
                    fields.push("name");
                }
                if a.description != b.description {
                    fields.push("description");
                }
            }
            (ResourceData::Item(a), ResourceData::Item(b)) => {
                if a.name != b.name {
                    fields.push("name");
                }
                if a.quantity != b.quantity {
                    fields.push("quantity");
                }
                if a.completed != b.completed {
                    fields.push("completed");
                }
                if a.description != b.description {
                    fields.push("description");
                }
                if a.order != b.order {
                    fields.push("order");
                }
            }
            _ => fields.push("kind"),
        }
        fields
    }
}

/// A cached list or item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub version: u64,
    pub data: ResourceData,
    /// Remote modification time of the last confirmed state
    pub updated_at: DateTime<Utc>,
    /// An outstanding operation references this record
    pub pending: bool,
    /// Tombstone while a delete is pending
    pub deleted: bool,
    /// The id was assigned locally and is not known to the remote yet
    pub provisional: bool,
}

impl ResourceRecord {
    /// A record created optimistically before the remote has seen it
    pub fn provisional(parent_id: Option<String>, data: ResourceData, now: DateTime<Utc>) -> Self {
        Self {
            id: new_provisional_id(),
            kind: data.kind(),
            parent_id,
            version: 0,
            data,
            updated_at: now,
            pending: true,
            deleted: false,
            provisional: true,
        }
    }

    /// A record mirroring confirmed remote state
    pub fn confirmed(remote: &RemoteRecord) -> Self {
        Self {
            id: remote.id.clone(),
            kind: remote.kind,
            parent_id: remote.parent_id.clone(),
            version: remote.version,
            data: remote.data.clone(),
            updated_at: remote.updated_at,
            pending: false,
            deleted: false,
            provisional: false,
        }
    }

    pub fn list_fields(&self) -> Option<&ListFields> {
        match &self.data {
            ResourceData::List(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn item_fields(&self) -> Option<&ItemFields> {
        match &self.data {
            ResourceData::Item(fields) => Some(fields),
            _ => None,
        }
    }
}

pub fn new_provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}
