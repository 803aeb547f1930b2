//! Queue data types
//!
//! Defines the durable operation record and its strongly-typed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{ItemFields, ListFields, ResourceData};

/// Kind of mutation an operation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Reorder,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Reorder => "reorder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "reorder" => Some(OperationKind::Reorder),
            _ => None,
        }
    }
}

/// Kind of resource a record or operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    List,
    Item,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::List => "list",
            ResourceKind::Item => "item",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(ResourceKind::List),
            "item" => Some(ResourceKind::Item),
            _ => None,
        }
    }
}

/// Lifecycle status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    /// Confirmed by the remote; only seen on settled operations handed to subscribers
    Done,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Failed => "failed",
            OperationStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "in_flight" => Some(OperationStatus::InFlight),
            "failed" => Some(OperationStatus::Failed),
            "done" => Some(OperationStatus::Done),
            _ => None,
        }
    }
}

/// Partial update of a list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ListPatch {
    /// Overlay `newer` on top of this patch, newer fields win
    pub fn overlay(&mut self, newer: &ListPatch) {
        if newer.name.is_some() {
            self.name = newer.name.clone();
        }
        if newer.description.is_some() {
            self.description = newer.description.clone();
        }
    }

    /// A patch setting every field to the given values
    pub fn full(fields: &ListFields) -> Self {
        Self {
            name: Some(fields.name.clone()),
            description: Some(fields.description.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

/// Partial update of an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl ItemPatch {
    pub fn overlay(&mut self, newer: &ItemPatch) {
        if newer.name.is_some() {
            self.name = newer.name.clone();
        }
        if newer.quantity.is_some() {
            self.quantity = newer.quantity;
        }
        if newer.completed.is_some() {
            self.completed = newer.completed;
        }
        if newer.description.is_some() {
            self.description = newer.description.clone();
        }
        if newer.order.is_some() {
            self.order = newer.order;
        }
    }

    pub fn full(fields: &ItemFields) -> Self {
        Self {
            name: Some(fields.name.clone()),
            quantity: Some(fields.quantity),
            completed: Some(fields.completed),
            description: Some(fields.description.clone()),
            order: Some(fields.order),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.quantity.is_none()
            && self.completed.is_none()
            && self.description.is_none()
            && self.order.is_none()
    }
}

/// Patch for either resource kind, as sent to the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePatch {
    List(ListPatch),
    Item(ItemPatch),
}

impl ResourcePatch {
    /// A patch that rewrites every field of `data`
    pub fn full(data: &ResourceData) -> Self {
        match data {
            ResourceData::List(fields) => ResourcePatch::List(ListPatch::full(fields)),
            ResourceData::Item(fields) => ResourcePatch::Item(ItemPatch::full(fields)),
        }
    }
}

/// New position of an item inside its list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOrder {
    pub id: String,
    pub order: i64,
}

/// Operation payload, one variant per (kind, resource kind) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    CreateList(ListFields),
    UpdateList(ListPatch),
    DeleteList,
    CreateItem(ItemFields),
    UpdateItem(ItemPatch),
    DeleteItem,
    ReorderItems { orders: Vec<ItemOrder> },
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::CreateList(_) | OperationPayload::CreateItem(_) => {
                OperationKind::Create
            }
            OperationPayload::UpdateList(_) | OperationPayload::UpdateItem(_) => {
                OperationKind::Update
            }
            OperationPayload::DeleteList | OperationPayload::DeleteItem => OperationKind::Delete,
            OperationPayload::ReorderItems { .. } => OperationKind::Reorder,
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            OperationPayload::CreateList(_)
            | OperationPayload::UpdateList(_)
            | OperationPayload::DeleteList => ResourceKind::List,
            OperationPayload::CreateItem(_)
            | OperationPayload::UpdateItem(_)
            | OperationPayload::DeleteItem
            | OperationPayload::ReorderItems { .. } => ResourceKind::Item,
        }
    }

    /// The update payload for `kind` carrying `patch`
    pub fn update(patch: ResourcePatch) -> Self {
        match patch {
            ResourcePatch::List(p) => OperationPayload::UpdateList(p),
            ResourcePatch::Item(p) => OperationPayload::UpdateItem(p),
        }
    }

    /// The delete payload for `kind`
    pub fn delete(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::List => OperationPayload::DeleteList,
            ResourceKind::Item => OperationPayload::DeleteItem,
        }
    }

    /// Patch carried by an update payload
    pub fn patch(&self) -> Option<ResourcePatch> {
        match self {
            OperationPayload::UpdateList(p) => Some(ResourcePatch::List(p.clone())),
            OperationPayload::UpdateItem(p) => Some(ResourcePatch::Item(p.clone())),
            _ => None,
        }
    }

    /// Overlay a newer update on top of this payload.
    ///
    /// Works on update payloads and on create payloads (folding an edit into a
    /// not-yet-synced create). Returns false when the kinds do not line up.
    pub fn absorb(&mut self, newer: &OperationPayload) -> bool {
        match (self, newer) {
            (OperationPayload::UpdateList(current), OperationPayload::UpdateList(patch)) => {
                current.overlay(patch);
                true
            }
            (OperationPayload::UpdateItem(current), OperationPayload::UpdateItem(patch)) => {
                current.overlay(patch);
                true
            }
            (OperationPayload::CreateList(fields), OperationPayload::UpdateList(patch)) => {
                fields.apply(patch);
                true
            }
            (OperationPayload::CreateItem(fields), OperationPayload::UpdateItem(patch)) => {
                fields.apply(patch);
                true
            }
            _ => false,
        }
    }

    /// Replace references to `old_id` in payload-embedded ids
    pub fn rewrite_id(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        if let OperationPayload::ReorderItems { orders } = self {
            for order in orders.iter_mut() {
                if order.id == old_id {
                    order.id = new_id.to_string();
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Identity of the resource an operation targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub parent_id: Option<String>,
}

/// A durable record of one intended mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: OperationKind,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub payload: OperationPayload,
    pub base_version: u64,
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            resource_kind: self.resource_kind,
            resource_id: self.resource_id.clone(),
            parent_id: self.parent_id.clone(),
        }
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::InFlight | OperationStatus::Failed
        )
    }
}

/// Queue size by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_discriminants() {
        let payload = OperationPayload::UpdateItem(ItemPatch::default());
        assert_eq!(payload.kind(), OperationKind::Update);
        assert_eq!(payload.resource_kind(), ResourceKind::Item);

        let reorder = OperationPayload::ReorderItems { orders: vec![] };
        assert_eq!(reorder.kind(), OperationKind::Reorder);
        assert_eq!(reorder.resource_kind(), ResourceKind::Item);

        assert_eq!(OperationPayload::DeleteList.kind(), OperationKind::Delete);
        assert_eq!(OperationPayload::DeleteList.resource_kind(), ResourceKind::List);
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = OperationPayload::UpdateList(ListPatch {
            name: Some("Groceries".to_string()),
            description: None,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "update_list");
        assert_eq!(json["name"], "Groceries");
        assert!(json.get("description").is_none());

        let unit = serde_json::to_value(&OperationPayload::DeleteItem).unwrap();
        assert_eq!(unit, serde_json::json!({"type": "delete_item"}));
    }

    #[test]
    fn test_absorb_overlays_later_fields() {
        let mut first = OperationPayload::UpdateItem(ItemPatch {
            name: Some("A".to_string()),
            quantity: Some(1),
            ..Default::default()
        });
        let second = OperationPayload::UpdateItem(ItemPatch {
            name: Some("B".to_string()),
            ..Default::default()
        });

        assert!(first.absorb(&second));
        match first {
            OperationPayload::UpdateItem(patch) => {
                assert_eq!(patch.name.as_deref(), Some("B"));
                assert_eq!(patch.quantity, Some(1));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_absorb_folds_update_into_create() {
        let mut create = OperationPayload::CreateList(ListFields {
            name: "Draft".to_string(),
            description: String::new(),
        });
        let update = OperationPayload::UpdateList(ListPatch {
            name: Some("Final".to_string()),
            description: None,
        });

        assert!(create.absorb(&update));
        assert_eq!(
            create,
            OperationPayload::CreateList(ListFields {
                name: "Final".to_string(),
                description: String::new(),
            })
        );

        assert!(!create.absorb(&OperationPayload::DeleteList));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::InFlight,
            OperationStatus::Failed,
            OperationStatus::Done,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationStatus::parse("bogus"), None);
    }
}
