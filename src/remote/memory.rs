//! In-process versioned remote
//!
//! Holds records in memory with the same version gate and status semantics as
//! the REST server. Reachability, latency and failures can be scripted, which
//! makes it the remote of choice for tests and local demos.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{HealthProbe, RemoteApi, RemoteRecord};
use crate::cache::ResourceData;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::queue::{ItemOrder, OperationPayload, ResourceKind, ResourcePatch};

#[derive(Default)]
struct State {
    records: HashMap<String, RemoteRecord>,
    next_id: u64,
    reachable: bool,
    latency: Option<Duration>,
    /// Consumed one per mutating call
    scripted: VecDeque<SyncError>,
    /// Returned by every mutating call while set
    persistent: Option<u16>,
    calls: usize,
}

/// Versioned in-memory remote store
#[derive(Clone)]
pub struct InMemoryRemote {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// A reachable, empty remote
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                next_id: 1,
                ..Default::default()
            })),
            clock,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Fail the next mutating call with `error`
    pub fn fail_next(&self, error: SyncError) {
        self.state.lock().scripted.push_back(error);
    }

    /// Answer every mutating call with an HTTP `status` until cleared
    pub fn fail_with_status(&self, status: Option<u16>) {
        self.state.lock().persistent = status;
    }

    /// Number of mutating calls that reached the store
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    pub fn get(&self, id: &str) -> Option<RemoteRecord> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a record as if another client had created it
    pub fn seed(&self, parent_id: Option<&str>, data: ResourceData) -> RemoteRecord {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = RemoteRecord {
            id: allocate_id(&mut state, data.kind()),
            kind: data.kind(),
            parent_id: parent_id.map(str::to_string),
            version: 1,
            updated_at: now,
            data,
        };
        state.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Overwrite a record's data as another client would, bumping its version
    pub fn edit(&self, id: &str, data: ResourceData) -> Option<RemoteRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state.records.get_mut(id)?;
        record.data = data;
        record.version += 1;
        record.updated_at = now;
        Some(record.clone())
    }

    /// Delete a record (and a list's items) as another client would
    pub fn remove(&self, id: &str) -> Option<RemoteRecord> {
        let mut state = self.state.lock();
        let removed = state.records.remove(id)?;
        state
            .records
            .retain(|_, r| r.parent_id.as_deref() != Some(id));
        Some(removed)
    }

    /// Common prelude of every call: latency, reachability, scripted failures
    async fn enter(&self, mutating: bool) -> Result<()> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if !state.reachable {
            return Err(SyncError::Unreachable("remote is offline".to_string()));
        }
        if !mutating {
            return Ok(());
        }

        state.calls += 1;
        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(status) = state.persistent {
            return Err(crate::error::classify_http_status(
                status,
                "scripted failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn allocate_id(state: &mut State, kind: ResourceKind) -> String {
    let id = format!("{}-{}", kind.as_str(), state.next_id);
    state.next_id += 1;
    id
}

fn not_found(kind: ResourceKind, id: &str) -> SyncError {
    SyncError::NotFound(format!("{} {}", kind.as_str(), id))
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn create(
        &self,
        kind: ResourceKind,
        parent_id: Option<&str>,
        data: &ResourceData,
    ) -> Result<RemoteRecord> {
        self.enter(true).await?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        if data.kind() != kind {
            return Err(SyncError::Rejected {
                status: 422,
                message: format!("{} create with mismatched data", kind.as_str()),
            });
        }
        if kind == ResourceKind::Item {
            let list_id = parent_id.unwrap_or_default();
            if !state.records.contains_key(list_id) {
                return Err(not_found(ResourceKind::List, list_id));
            }
        }

        let record = RemoteRecord {
            id: allocate_id(&mut state, kind),
            kind,
            parent_id: parent_id.map(str::to_string),
            version: 1,
            updated_at: now,
            data: data.clone(),
        };
        state.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: &ResourcePatch,
        base_version: u64,
    ) -> Result<RemoteRecord> {
        self.enter(true).await?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let record = state
            .records
            .get_mut(id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| not_found(kind, id))?;

        if record.version != base_version {
            return Err(SyncError::VersionConflict {
                current: Some(Box::new(record.clone())),
            });
        }

        if !record.data.apply(&OperationPayload::update(patch.clone())) {
            return Err(SyncError::Rejected {
                status: 422,
                message: format!("patch does not fit {} {}", kind.as_str(), id),
            });
        }
        record.version += 1;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn delete(&self, kind: ResourceKind, id: &str, base_version: u64) -> Result<()> {
        self.enter(true).await?;
        let mut state = self.state.lock();

        let record = state
            .records
            .get(id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| not_found(kind, id))?;

        if record.version != base_version {
            return Err(SyncError::VersionConflict {
                current: Some(Box::new(record.clone())),
            });
        }

        state.records.remove(id);
        state
            .records
            .retain(|_, r| r.parent_id.as_deref() != Some(id));
        Ok(())
    }

    async fn reorder(&self, list_id: &str, orders: &[ItemOrder]) -> Result<Vec<ItemOrder>> {
        self.enter(true).await?;
        let mut state = self.state.lock();

        if !state.records.contains_key(list_id) {
            return Err(not_found(ResourceKind::List, list_id));
        }

        let mut applied = Vec::with_capacity(orders.len());
        for order in orders {
            let Some(record) = state.records.get_mut(&order.id) else {
                continue;
            };
            if record.parent_id.as_deref() != Some(list_id) {
                continue;
            }
            if let ResourceData::Item(fields) = &mut record.data {
                fields.order = order.order;
                applied.push(order.clone());
            }
        }
        Ok(applied)
    }

    async fn fetch(&self, kind: ResourceKind, id: &str) -> Result<Option<RemoteRecord>> {
        self.enter(false).await?;
        Ok(self
            .state
            .lock()
            .records
            .get(id)
            .filter(|r| r.kind == kind)
            .cloned())
    }
}

#[async_trait]
impl HealthProbe for InMemoryRemote {
    async fn probe(&self) -> bool {
        self.is_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ItemFields, ListFields};
    use crate::queue::ListPatch;

    #[tokio::test]
    async fn test_update_is_version_gated() {
        let remote = InMemoryRemote::new();
        let list = remote
            .create(
                ResourceKind::List,
                None,
                &ResourceData::List(ListFields::new("Groceries")),
            )
            .await
            .unwrap();
        assert_eq!(list.version, 1);

        let patch = ResourcePatch::List(ListPatch {
            name: Some("Weekly".to_string()),
            description: None,
        });
        let updated = remote
            .update(ResourceKind::List, &list.id, &patch, 1)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let stale = remote.update(ResourceKind::List, &list.id, &patch, 1).await;
        match stale {
            Err(SyncError::VersionConflict { current: Some(current) }) => {
                assert_eq!(current.version, 2)
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_and_scripted_failures() {
        let remote = InMemoryRemote::new();
        remote.set_reachable(false);
        assert!(!remote.probe().await);

        let result = remote
            .create(
                ResourceKind::List,
                None,
                &ResourceData::List(ListFields::new("x")),
            )
            .await;
        assert!(matches!(result, Err(SyncError::Unreachable(_))));

        remote.set_reachable(true);
        remote.fail_next(SyncError::Timeout);
        let result = remote
            .create(
                ResourceKind::List,
                None,
                &ResourceData::List(ListFields::new("x")),
            )
            .await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_list_delete_removes_items() {
        let remote = InMemoryRemote::new();
        let list = remote.seed(None, ResourceData::List(ListFields::new("Groceries")));
        let item = remote.seed(Some(&list.id), ResourceData::Item(ItemFields::new("Milk")));

        remote.delete(ResourceKind::List, &list.id, 1).await.unwrap();

        assert!(remote.get(&item.id).is_none());
        assert!(remote
            .fetch(ResourceKind::List, &list.id)
            .await
            .unwrap()
            .is_none());
    }
}
