//! Mutation entry points and cache reads
//!
//! Every mutation writes the cache optimistically, queues the matching
//! operation and kicks the orchestrator. Reads never touch the remote.

use super::SyncContext;
use crate::cache::{CacheRepository, ItemFields, ListFields, ResourceData, ResourceRecord};
use crate::error::{Result, SyncError};
use crate::queue::{
    ItemOrder, ItemPatch, ListPatch, Operation, OperationKind, OperationPayload, OperationStatus,
    QueueRepository, ResourceKey, ResourceKind, ResourcePatch,
};

impl SyncContext {
    pub async fn create_list(&self, fields: ListFields) -> Result<ResourceRecord> {
        self.create_resource(None, ResourceData::List(fields)).await
    }

    pub async fn update_list(&self, list_id: &str, patch: ListPatch) -> Result<ResourceRecord> {
        self.update_resource(ResourceKind::List, list_id, ResourcePatch::List(patch))
            .await
    }

    /// Delete a list together with its items
    pub async fn delete_list(&self, list_id: &str) -> Result<()> {
        self.delete_resource(ResourceKind::List, list_id).await
    }

    pub async fn create_item(&self, list_id: &str, fields: ItemFields) -> Result<ResourceRecord> {
        self.create_resource(Some(list_id), ResourceData::Item(fields))
            .await
    }

    pub async fn update_item(&self, item_id: &str, patch: ItemPatch) -> Result<ResourceRecord> {
        self.update_resource(ResourceKind::Item, item_id, ResourcePatch::Item(patch))
            .await
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.delete_resource(ResourceKind::Item, item_id).await
    }

    /// Move items within a list. The remote applies the latest order as is.
    pub async fn reorder_items(&self, list_id: &str, orders: Vec<ItemOrder>) -> Result<()> {
        {
            let _writes = self.orchestrator.lock_local_writes().await;
            let cache = CacheRepository::new(&self.pool);
            self.visible_list(&cache, list_id).await?;

            self.queue()
                .add_operation(
                    OperationPayload::ReorderItems {
                        orders: orders.clone(),
                    },
                    list_id,
                    0,
                    Some(list_id),
                )
                .await?;
            cache.apply_orders(list_id, &orders).await?;
        }

        self.orchestrator.trigger();
        Ok(())
    }

    /// Visible lists
    pub async fn lists(&self) -> Result<Vec<ResourceRecord>> {
        CacheRepository::new(&self.pool).lists().await
    }

    /// Visible items of a list in display order
    pub async fn items(&self, list_id: &str) -> Result<Vec<ResourceRecord>> {
        CacheRepository::new(&self.pool).items(list_id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        CacheRepository::new(&self.pool).get_visible(id).await
    }

    pub async fn pending_operations(&self) -> Result<Vec<Operation>> {
        self.queue().get_pending().await
    }

    /// Operations parked as failed, oldest first
    pub async fn failed_operations(&self) -> Result<Vec<Operation>> {
        self.queue().list_failed().await
    }

    /// Give a failed operation a fresh retry budget and drain
    pub async fn retry_failed(&self, operation_id: &str) -> Result<bool> {
        let retried = self.queue().retry_failed(operation_id).await?;
        if retried {
            tracing::info!("Retrying operation {}", operation_id);
            self.orchestrator.trigger();
        }
        Ok(retried)
    }

    /// Drop a queued operation and undo its optimistic effect on the cache
    pub async fn discard_operation(&self, operation_id: &str) -> Result<bool> {
        let _writes = self.orchestrator.lock_local_writes().await;
        let queue = self.queue();
        let cache = CacheRepository::new(&self.pool);

        let Some(op) = queue.get(operation_id).await? else {
            return Ok(false);
        };
        if op.status == OperationStatus::InFlight {
            tracing::warn!("Not discarding {}: it is on the wire", op.id);
            return Ok(false);
        }

        queue.remove(&op.id).await?;

        match op.kind {
            OperationKind::Create => {
                cache.remove(&op.resource_id).await?;
                if op.resource_kind == ResourceKind::List {
                    queue.remove_for_parent(&op.resource_id).await?;
                    cache.remove_children(&op.resource_id).await?;
                }
            }
            OperationKind::Delete => {
                cache.untombstone(&op.resource_id).await?;
                cache.set_pending(&op.resource_id, false).await?;
            }
            OperationKind::Update => self.restore_confirmed(&cache, &op).await?,
            OperationKind::Reorder => {}
        }

        tracing::info!(
            "Discarded {} {} {}",
            op.kind.as_str(),
            op.resource_kind.as_str(),
            op.resource_id
        );
        Ok(true)
    }

    /// Put the remote's state back in place of a discarded update
    async fn restore_confirmed(&self, cache: &CacheRepository<'_>, op: &Operation) -> Result<()> {
        if self.monitor.is_reachable() {
            let fetch = self.remote.fetch(op.resource_kind, &op.resource_id);
            match tokio::time::timeout(self.config.request_timeout, fetch).await {
                Ok(Ok(Some(remote))) => return cache.put(&ResourceRecord::confirmed(&remote)).await,
                Ok(Ok(None)) => {
                    cache.remove(&op.resource_id).await?;
                    return Ok(());
                }
                Ok(Err(e)) => tracing::debug!("Could not refetch {}: {}", op.resource_id, e),
                Err(_) => tracing::debug!("Refetch of {} timed out", op.resource_id),
            }
        }

        // Keep the local fields, they are all we have
        cache.set_pending(&op.resource_id, false).await?;
        Ok(())
    }

    async fn create_resource(
        &self,
        parent_id: Option<&str>,
        data: ResourceData,
    ) -> Result<ResourceRecord> {
        let record = {
            let _writes = self.orchestrator.lock_local_writes().await;
            let cache = CacheRepository::new(&self.pool);

            if let Some(list_id) = parent_id {
                self.visible_list(&cache, list_id).await?;
            }

            let record = ResourceRecord::provisional(
                parent_id.map(str::to_string),
                data.clone(),
                self.clock.now(),
            );
            let payload = match data {
                ResourceData::List(fields) => OperationPayload::CreateList(fields),
                ResourceData::Item(fields) => OperationPayload::CreateItem(fields),
            };

            self.queue()
                .add_operation(payload, &record.id, 0, parent_id)
                .await?;
            cache.put(&record).await?;
            record
        };

        tracing::debug!("Created {} {}", record.kind.as_str(), record.id);
        self.orchestrator.trigger();
        Ok(record)
    }

    async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: ResourcePatch,
    ) -> Result<ResourceRecord> {
        let record = {
            let _writes = self.orchestrator.lock_local_writes().await;
            let cache = CacheRepository::new(&self.pool);

            let mut record = match cache.get(id).await? {
                Some(record) if record.kind != kind => return Err(not_found(kind, id)),
                Some(record) if record.deleted => {
                    return Err(SyncError::ResourceDeleted(id.to_string()))
                }
                Some(record) => record,
                None => return Err(not_found(kind, id)),
            };

            let payload = OperationPayload::update(patch);
            if payload.patch().is_some_and(|p| is_empty(&p)) {
                return Ok(record);
            }
            record.data.apply(&payload);
            record.pending = true;

            self.queue()
                .add_operation(payload, id, record.version, record.parent_id.as_deref())
                .await?;
            cache.put(&record).await?;
            record
        };

        self.orchestrator.trigger();
        Ok(record)
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        {
            let _writes = self.orchestrator.lock_local_writes().await;
            let cache = CacheRepository::new(&self.pool);
            let queue = self.queue();

            let record = match cache.get(id).await? {
                Some(record) if record.kind == kind => record,
                _ => return Err(not_found(kind, id)),
            };
            if record.deleted {
                return Ok(());
            }

            let key = ResourceKey {
                resource_kind: kind,
                resource_id: id.to_string(),
                parent_id: record.parent_id.clone(),
            };

            if record.provisional {
                let create_on_wire = queue.ops_for_key(&key).await?.iter().any(|op| {
                    op.kind == OperationKind::Create && op.status == OperationStatus::InFlight
                });

                if !create_on_wire {
                    // The remote never saw it
                    queue.remove_for_key(&key).await?;
                    cache.remove(id).await?;
                    if kind == ResourceKind::List {
                        queue.remove_for_parent(id).await?;
                        cache.remove_children(id).await?;
                    }
                    tracing::debug!("Dropped unsynced {} {}", kind.as_str(), id);
                    return Ok(());
                }
            }

            if kind == ResourceKind::List {
                let dropped = queue.remove_for_parent(id).await?;
                if dropped > 0 {
                    tracing::debug!("Delete of list {} dropped {} item operation(s)", id, dropped);
                }
            }

            queue
                .add_operation(
                    OperationPayload::delete(kind),
                    id,
                    record.version,
                    record.parent_id.as_deref(),
                )
                .await?;
            cache.tombstone(id).await?;
        }

        self.orchestrator.trigger();
        Ok(())
    }

    async fn visible_list(&self, cache: &CacheRepository<'_>, list_id: &str) -> Result<ResourceRecord> {
        match cache.get(list_id).await? {
            Some(list) if list.kind == ResourceKind::List && list.deleted => {
                Err(SyncError::ResourceDeleted(list_id.to_string()))
            }
            Some(list) if list.kind == ResourceKind::List => Ok(list),
            _ => Err(not_found(ResourceKind::List, list_id)),
        }
    }
}

fn not_found(kind: ResourceKind, id: &str) -> SyncError {
    SyncError::NotFound(format!("{} {}", kind.as_str(), id))
}

fn is_empty(patch: &ResourcePatch) -> bool {
    match patch {
        ResourcePatch::List(p) => p.is_empty(),
        ResourcePatch::Item(p) => p.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::remote::InMemoryRemote;
    use std::sync::Arc;

    /// A context whose remote is offline, so nothing drains behind the test's back
    async fn offline_context() -> (SyncContext, InMemoryRemote) {
        let pool = create_memory_pool().await.unwrap();
        let remote = InMemoryRemote::new();
        remote.set_reachable(false);
        let ctx = SyncContext::builder(pool, Arc::new(remote.clone()), Arc::new(remote.clone()))
            .build();
        (ctx, remote)
    }

    #[tokio::test]
    async fn test_optimistic_create_and_update() {
        let (ctx, _remote) = offline_context().await;

        let list = ctx.create_list(ListFields::new("Groceries")).await.unwrap();
        assert!(list.provisional);

        let item = ctx
            .create_item(&list.id, ItemFields::new("Milk"))
            .await
            .unwrap();
        let updated = ctx
            .update_item(
                &item.id,
                ItemPatch {
                    quantity: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.item_fields().unwrap().quantity, 2);

        let items = ctx.items(&list.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_fields().unwrap().quantity, 2);

        // The update folded into the unsent create
        let pending = ctx.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending[1].payload,
            OperationPayload::CreateItem(ItemFields {
                quantity: 2,
                ..ItemFields::new("Milk")
            })
        );
    }

    #[tokio::test]
    async fn test_deleting_unsynced_list_leaves_nothing() {
        let (ctx, remote) = offline_context().await;

        let list = ctx.create_list(ListFields::new("Groceries")).await.unwrap();
        ctx.create_item(&list.id, ItemFields::new("Milk"))
            .await
            .unwrap();
        ctx.delete_list(&list.id).await.unwrap();

        assert!(ctx.lists().await.unwrap().is_empty());
        assert!(ctx.items(&list.id).await.unwrap().is_empty());
        assert!(ctx.pending_operations().await.unwrap().is_empty());
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_blocks_updates() {
        let (ctx, remote) = offline_context().await;
        let seeded = remote.seed(None, ResourceData::List(ListFields::new("Groceries")));
        CacheRepository::new(&ctx.pool)
            .put(&ResourceRecord::confirmed(&seeded))
            .await
            .unwrap();

        ctx.delete_list(&seeded.id).await.unwrap();
        assert!(ctx.get(&seeded.id).await.unwrap().is_none());

        let result = ctx
            .update_list(
                &seeded.id,
                ListPatch {
                    name: Some("Weekly".to_string()),
                    description: None,
                },
            )
            .await;
        assert!(matches!(result, Err(SyncError::ResourceDeleted(_))));

        let pending = ctx.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Delete);
        assert_eq!(pending[0].base_version, 1);
    }

    #[tokio::test]
    async fn test_discard_delete_restores_record() {
        let (ctx, remote) = offline_context().await;
        let seeded = remote.seed(None, ResourceData::List(ListFields::new("Groceries")));
        CacheRepository::new(&ctx.pool)
            .put(&ResourceRecord::confirmed(&seeded))
            .await
            .unwrap();

        ctx.delete_list(&seeded.id).await.unwrap();
        let op = ctx.pending_operations().await.unwrap().remove(0);

        assert!(ctx.discard_operation(&op.id).await.unwrap());
        let restored = ctx.get(&seeded.id).await.unwrap().unwrap();
        assert!(!restored.pending);
        assert!(!ctx.discard_operation(&op.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutations_on_unknown_resources() {
        let (ctx, _remote) = offline_context().await;

        assert!(matches!(
            ctx.create_item("list-missing", ItemFields::new("Milk")).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            ctx.delete_item("item-missing").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_counts_queue() {
        let (ctx, _remote) = offline_context().await;
        ctx.create_list(ListFields::new("a")).await.unwrap();
        ctx.create_list(ListFields::new("b")).await.unwrap();

        let status = ctx.status().await.unwrap();
        assert_eq!(status.pending_changes, 2);
        assert_eq!(status.failed_changes, 0);
        assert!(!status.reachable);
        assert!(status.last_sync.is_none());
    }
}
