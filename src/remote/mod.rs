//! Remote store interface
//!
//! The versioned authority the queue drains into. [`HttpRemote`] talks REST;
//! [`InMemoryRemote`] keeps the same semantics in-process.

mod http;
mod memory;

pub use http::*;
pub use memory::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ResourceData;
use crate::error::Result;
use crate::queue::{ItemOrder, ResourceKind, ResourcePatch};

/// A resource as the remote currently holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub data: ResourceData,
}

/// Versioned CRUD against the remote store.
///
/// `update` and `delete` are gated on `base_version` and fail with
/// `SyncError::VersionConflict` when it is stale. `reorder` is not gated:
/// the last writer's order wins.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(
        &self,
        kind: ResourceKind,
        parent_id: Option<&str>,
        data: &ResourceData,
    ) -> Result<RemoteRecord>;

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: &ResourcePatch,
        base_version: u64,
    ) -> Result<RemoteRecord>;

    async fn delete(&self, kind: ResourceKind, id: &str, base_version: u64) -> Result<()>;

    async fn reorder(&self, list_id: &str, orders: &[ItemOrder]) -> Result<Vec<ItemOrder>>;

    /// Current state, `None` once the resource is gone
    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Option<RemoteRecord>>;
}

/// Active reachability check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}
