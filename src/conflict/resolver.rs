//! Three-way conflict resolution
//!
//! Rebuilds the local intent of a stale operation, compares it with the
//! remote's current state and applies the chosen [`Resolution`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::handler::ResolutionHandler;
use super::types::{ConflictContext, LocalIntent, Resolution};
use crate::cache::{CacheRepository, ItemFields, ListFields, ResourceData, ResourceRecord};
use crate::clock::Clock;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::queue::{
    ItemPatch, ListPatch, Operation, OperationKind, OperationPayload, QueueRepository,
    ResourceKind, ResourcePatch,
};
use crate::remote::{RemoteApi, RemoteRecord};

/// How a conflict ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    Resolved {
        resolution: Resolution,
        automatic: bool,
    },
    /// The operation was parked as failed with this reason
    Failed(String),
    /// A newer local edit replaced the operation while it was being resolved
    Superseded,
}

/// Resolves version conflicts for queued operations
pub struct ConflictResolver<'a> {
    pool: &'a SqlitePool,
    remote: &'a dyn RemoteApi,
    handler: &'a dyn ResolutionHandler,
    clock: &'a dyn Clock,
    events: &'a EventBus,
    local_writes: Option<&'a Mutex<()>>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        pool: &'a SqlitePool,
        remote: &'a dyn RemoteApi,
        handler: &'a dyn ResolutionHandler,
        clock: &'a dyn Clock,
        events: &'a EventBus,
    ) -> Self {
        Self {
            pool,
            remote,
            handler,
            clock,
            events,
            local_writes: None,
        }
    }

    /// Hold `lock` while applying a decision so local edits cannot interleave
    pub fn with_write_lock(mut self, lock: &'a Mutex<()>) -> Self {
        self.local_writes = Some(lock);
        self
    }

    fn queue(&self) -> QueueRepository<'_> {
        QueueRepository::with_clock(self.pool, self.clock)
    }

    fn cache(&self) -> CacheRepository<'_> {
        CacheRepository::new(self.pool)
    }

    /// Resolve a conflict for `op`, which the remote rejected as stale or missing
    pub async fn resolve(&self, op: &Operation) -> Result<ConflictOutcome> {
        if !matches!(op.kind, OperationKind::Update | OperationKind::Delete) {
            return self
                .fail(op, format!("{} operations cannot conflict", op.kind.as_str()))
                .await;
        }

        let remote = match self.remote.fetch(op.resource_kind, &op.resource_id).await {
            Ok(remote) => remote,
            Err(e) => return self.fail(op, e.to_string()).await,
        };

        let base = self.cache().get(&op.resource_id).await?;
        let Some(local) = local_intent(op, base.as_ref(), remote.as_ref()) else {
            return self.fail(op, "no base state to apply the change to".to_string()).await;
        };

        let context = build_context(op, local, remote, base);

        let (resolution, automatic) = if is_metadata_only(&context) {
            (Resolution::Merge, true)
        } else {
            match self.handler.resolve(&context).await {
                Some(resolution) if context.allows(resolution) => (resolution, false),
                Some(resolution) => {
                    return self
                        .fail(
                            op,
                            format!("{} is not allowed for this conflict", resolution.as_str()),
                        )
                        .await
                }
                None => return self.fail(op, "no decision was made".to_string()).await,
            }
        };

        let _writes = match self.local_writes {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if self.queue().get(&op.id).await?.is_none() {
            tracing::debug!("Operation {} was superseded during conflict resolution", op.id);
            return Ok(ConflictOutcome::Superseded);
        }

        tracing::info!(
            "Resolving conflict on {} {} with {}{}",
            op.resource_kind.as_str(),
            op.resource_id,
            resolution.as_str(),
            if automatic { " (automatic)" } else { "" }
        );

        match resolution {
            Resolution::UseLocal => self.use_local(&context).await?,
            Resolution::UseServer => self.use_server(&context).await?,
            Resolution::Merge => self.merge(&context).await?,
            Resolution::Cancel => self.cancel(&context).await?,
        }

        self.events.publish(SyncEvent::ConflictResolved {
            operation_id: op.id.clone(),
            resource_id: op.resource_id.clone(),
            resolution,
            automatic,
        });

        Ok(ConflictOutcome::Resolved {
            resolution,
            automatic,
        })
    }

    async fn fail(&self, op: &Operation, reason: String) -> Result<ConflictOutcome> {
        let reason = format!("conflict resolution failed: {}", reason);
        tracing::warn!("{} ({})", reason, op.id);
        self.queue().mark_failed(&op.id, None, &reason).await?;
        Ok(ConflictOutcome::Failed(reason))
    }

    /// Resubmit the local intent on top of the remote version
    async fn use_local(&self, context: &ConflictContext) -> Result<()> {
        let op = &context.operation;
        let Some(remote) = &context.remote else {
            return Ok(());
        };

        match &context.local {
            LocalIntent::Write(data) => {
                let payload = OperationPayload::update(ResourcePatch::full(data));
                self.queue()
                    .replace_payload(&op.id, &payload, remote.version)
                    .await?;
                self.write_pending(context, data.clone(), remote).await
            }
            LocalIntent::Remove => {
                self.queue()
                    .replace_payload(&op.id, &op.payload, remote.version)
                    .await?;
                Ok(())
            }
        }
    }

    /// Adopt the remote state
    async fn use_server(&self, context: &ConflictContext) -> Result<()> {
        let op = &context.operation;
        let queue = self.queue();
        let cache = self.cache();

        match &context.remote {
            Some(remote) => {
                queue.remove(&op.id).await?;
                if op.kind == OperationKind::Delete {
                    // A list delete hid its items too
                    cache.untombstone(&op.resource_id).await?;
                }
                cache.put(&ResourceRecord::confirmed(remote)).await?;
            }
            None => {
                queue.remove_for_key(&op.key()).await?;
                cache.remove(&op.resource_id).await?;
                if op.resource_kind == ResourceKind::List {
                    queue.remove_for_parent(&op.resource_id).await?;
                    cache.remove_children(&op.resource_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn merge(&self, context: &ConflictContext) -> Result<()> {
        let (Some(remote), LocalIntent::Write(local)) = (&context.remote, &context.local) else {
            return Ok(());
        };
        let op = &context.operation;

        let local_base_time = context
            .base
            .as_ref()
            .map(|b| b.updated_at)
            .unwrap_or(remote.updated_at);
        let merged = merge_fields(
            local,
            &remote.data,
            &op.payload,
            op.created_at,
            local_base_time,
            remote.updated_at,
        );

        if merged.differing_fields(&remote.data).is_empty() {
            self.queue().remove(&op.id).await?;
            self.cache().put(&ResourceRecord::confirmed(remote)).await?;
            return Ok(());
        }

        let payload = OperationPayload::update(ResourcePatch::full(&merged));
        self.queue()
            .replace_payload(&op.id, &payload, remote.version)
            .await?;
        self.write_pending(context, merged, remote).await
    }

    async fn cancel(&self, context: &ConflictContext) -> Result<()> {
        let op = &context.operation;
        let cache = self.cache();

        self.queue().remove(&op.id).await?;
        if op.kind == OperationKind::Delete {
            cache.untombstone(&op.resource_id).await?;
        }
        cache.set_pending(&op.resource_id, false).await?;
        Ok(())
    }

    /// Store resubmitted data over the remote's version, still pending
    async fn write_pending(
        &self,
        context: &ConflictContext,
        data: ResourceData,
        remote: &RemoteRecord,
    ) -> Result<()> {
        let mut record = context
            .base
            .clone()
            .unwrap_or_else(|| ResourceRecord::confirmed(remote));
        record.data = data;
        record.version = remote.version;
        record.updated_at = remote.updated_at;
        record.pending = true;
        record.deleted = false;
        self.cache().put(&record).await
    }
}

/// What the operation meant the resource to become
fn local_intent(
    op: &Operation,
    base: Option<&ResourceRecord>,
    remote: Option<&RemoteRecord>,
) -> Option<LocalIntent> {
    if op.kind == OperationKind::Delete {
        return Some(LocalIntent::Remove);
    }

    let mut data = base
        .map(|b| b.data.clone())
        .or_else(|| remote.map(|r| r.data.clone()))?;
    data.apply(&op.payload);
    Some(LocalIntent::Write(data))
}

fn build_context(
    op: &Operation,
    local: LocalIntent,
    remote: Option<RemoteRecord>,
    base: Option<ResourceRecord>,
) -> ConflictContext {
    let differing_fields = match (&local, &remote) {
        (LocalIntent::Write(data), Some(remote)) => data.differing_fields(&remote.data),
        _ => Vec::new(),
    };

    let allowed = match (&remote, &local) {
        (None, _) => vec![Resolution::UseServer, Resolution::Cancel],
        (Some(_), LocalIntent::Remove) => {
            vec![Resolution::UseLocal, Resolution::UseServer, Resolution::Cancel]
        }
        (Some(_), LocalIntent::Write(_)) => vec![
            Resolution::UseLocal,
            Resolution::UseServer,
            Resolution::Merge,
            Resolution::Cancel,
        ],
    };

    ConflictContext {
        operation: op.clone(),
        local,
        remote,
        base,
        differing_fields,
        allowed,
    }
}

/// Local and remote agree on every semantic field
fn is_metadata_only(context: &ConflictContext) -> bool {
    matches!(
        (&context.local, &context.remote),
        (LocalIntent::Write(_), Some(_))
    ) && context.differing_fields.is_empty()
}

/// Field-level merge: each field comes from whichever side changed it last.
///
/// Local fields touched by the operation carry the operation's timestamp, the
/// rest carry the cached record's. Ties go to the remote.
fn merge_fields(
    local: &ResourceData,
    remote: &ResourceData,
    payload: &OperationPayload,
    op_time: DateTime<Utc>,
    base_time: DateTime<Utc>,
    remote_time: DateTime<Utc>,
) -> ResourceData {
    let local_wins = |touched: bool| {
        let local_time = if touched { op_time } else { base_time };
        local_time > remote_time
    };

    match (local, remote) {
        (ResourceData::List(l), ResourceData::List(r)) => {
            let touched = match payload {
                OperationPayload::UpdateList(patch) => patch.clone(),
                _ => ListPatch::default(),
            };
            ResourceData::List(ListFields {
                name: pick(&l.name, &r.name, local_wins(touched.name.is_some())),
                description: pick(
                    &l.description,
                    &r.description,
                    local_wins(touched.description.is_some()),
                ),
            })
        }
        (ResourceData::Item(l), ResourceData::Item(r)) => {
            let touched = match payload {
                OperationPayload::UpdateItem(patch) => patch.clone(),
                _ => ItemPatch::default(),
            };
            ResourceData::Item(ItemFields {
                name: pick(&l.name, &r.name, local_wins(touched.name.is_some())),
                quantity: pick(&l.quantity, &r.quantity, local_wins(touched.quantity.is_some())),
                completed: pick(
                    &l.completed,
                    &r.completed,
                    local_wins(touched.completed.is_some()),
                ),
                description: pick(
                    &l.description,
                    &r.description,
                    local_wins(touched.description.is_some()),
                ),
                order: pick(&l.order, &r.order, local_wins(touched.order.is_some())),
            })
        }
        _ => remote.clone(),
    }
}

fn pick<T: Clone>(local: &T, remote: &T, local_wins: bool) -> T {
    if local_wins {
        local.clone()
    } else {
        remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::conflict::{DeferResolution, FixedResolution};
    use crate::db::create_memory_pool;
    use crate::queue::OperationStatus;
    use crate::remote::InMemoryRemote;
    use chrono::Duration;
    use std::sync::Arc;

    struct Fixture {
        pool: SqlitePool,
        remote: InMemoryRemote,
        events: EventBus,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                pool: create_memory_pool().await.unwrap(),
                // Remote writes happened an hour before any local edit
                remote: InMemoryRemote::with_clock(Arc::new(ManualClock::new(
                    Utc::now() - Duration::hours(1),
                ))),
                events: EventBus::default(),
            }
        }

        fn resolver<'a>(&'a self, handler: &'a dyn ResolutionHandler) -> ConflictResolver<'a> {
            ConflictResolver::new(&self.pool, &self.remote, handler, &SystemClock, &self.events)
        }

        /// Seed an item remotely, mirror it in the cache, queue a local update
        async fn stale_update(&self, patch: ItemPatch) -> (RemoteRecord, Operation) {
            let list = self.remote.seed(None, ResourceData::List(ListFields::new("Groceries")));
            let item = self
                .remote
                .seed(Some(&list.id), ResourceData::Item(ItemFields::new("Milk")));

            let mut cached = ResourceRecord::confirmed(&item);
            let payload = OperationPayload::UpdateItem(patch);
            cached.data.apply(&payload);
            cached.pending = true;
            CacheRepository::new(&self.pool).put(&cached).await.unwrap();

            let op = QueueRepository::new(&self.pool)
                .add_operation(payload, &item.id, item.version, Some(&list.id))
                .await
                .unwrap();
            (item, op)
        }
    }

    fn item_data(name: &str, quantity: u32, completed: bool) -> ResourceData {
        ResourceData::Item(ItemFields {
            name: name.to_string(),
            quantity,
            completed,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_metadata_only_conflict_merges_automatically() {
        let fx = Fixture::new().await;
        let (item, op) = fx
            .stale_update(ItemPatch {
                completed: Some(true),
                ..Default::default()
            })
            .await;
        fx.remote.edit(&item.id, item_data("Milk", 1, true)).unwrap();

        let outcome = fx.resolver(&DeferResolution).resolve(&op).await.unwrap();

        assert_eq!(
            outcome,
            ConflictOutcome::Resolved {
                resolution: Resolution::Merge,
                automatic: true
            }
        );
        assert!(QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().is_none());
        let cached = CacheRepository::new(&fx.pool).get(&item.id).await.unwrap().unwrap();
        assert_eq!(cached.version, 2);
        assert!(!cached.pending);
    }

    #[tokio::test]
    async fn test_semantic_difference_needs_a_decision() {
        let fx = Fixture::new().await;
        let (item, op) = fx
            .stale_update(ItemPatch {
                quantity: Some(3),
                ..Default::default()
            })
            .await;
        fx.remote.edit(&item.id, item_data("Milk", 2, false)).unwrap();

        let outcome = fx.resolver(&DeferResolution).resolve(&op).await.unwrap();

        match outcome {
            ConflictOutcome::Failed(reason) => {
                assert!(reason.starts_with("conflict resolution failed"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let parked = QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().unwrap();
        assert_eq!(parked.status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_use_local_resubmits_on_remote_version() {
        let fx = Fixture::new().await;
        let (item, op) = fx
            .stale_update(ItemPatch {
                quantity: Some(3),
                ..Default::default()
            })
            .await;
        fx.remote.edit(&item.id, item_data("Whole milk", 1, false)).unwrap();

        let handler = FixedResolution(Resolution::UseLocal);
        fx.resolver(&handler).resolve(&op).await.unwrap();

        let op = QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().unwrap();
        assert_eq!(op.base_version, 2);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(
            op.payload,
            OperationPayload::UpdateItem(ItemPatch::full(&ItemFields {
                name: "Milk".to_string(),
                quantity: 3,
                ..Default::default()
            }))
        );
    }

    #[tokio::test]
    async fn test_merge_takes_later_field_per_side() {
        let fx = Fixture::new().await;
        let (item, op) = fx
            .stale_update(ItemPatch {
                quantity: Some(3),
                ..Default::default()
            })
            .await;
        fx.remote.edit(&item.id, item_data("Whole milk", 1, false)).unwrap();

        let handler = FixedResolution(Resolution::Merge);
        fx.resolver(&handler).resolve(&op).await.unwrap();

        // The untouched name ties with the remote; the quantity edit is newer
        let cached = CacheRepository::new(&fx.pool).get(&item.id).await.unwrap().unwrap();
        assert_eq!(cached.data, item_data("Whole milk", 3, false));
        assert_eq!(cached.version, 2);
        assert!(cached.pending);
        let op = QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().unwrap();
        assert_eq!(op.base_version, 2);
    }

    #[tokio::test]
    async fn test_remote_deleted_allows_only_server_or_cancel() {
        let fx = Fixture::new().await;
        let (item, op) = fx
            .stale_update(ItemPatch {
                quantity: Some(3),
                ..Default::default()
            })
            .await;
        fx.remote.remove(&item.id);

        let merge = FixedResolution(Resolution::Merge);
        let outcome = fx.resolver(&merge).resolve(&op).await.unwrap();
        assert!(matches!(outcome, ConflictOutcome::Failed(_)));

        QueueRepository::new(&fx.pool).retry_failed(&op.id).await.unwrap();
        let use_server = FixedResolution(Resolution::UseServer);
        fx.resolver(&use_server).resolve(&op).await.unwrap();

        assert!(CacheRepository::new(&fx.pool).get(&item.id).await.unwrap().is_none());
        assert!(QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_use_server_on_list_delete_restores_items() {
        let fx = Fixture::new().await;
        let cache = CacheRepository::new(&fx.pool);
        let list = fx.remote.seed(None, ResourceData::List(ListFields::new("Groceries")));
        let item = fx
            .remote
            .seed(Some(&list.id), ResourceData::Item(ItemFields::new("Milk")));
        cache.put(&ResourceRecord::confirmed(&list)).await.unwrap();
        cache.put(&ResourceRecord::confirmed(&item)).await.unwrap();

        cache.tombstone(&list.id).await.unwrap();
        let op = QueueRepository::new(&fx.pool)
            .add_operation(OperationPayload::DeleteList, &list.id, list.version, None)
            .await
            .unwrap();
        fx.remote
            .edit(&list.id, ResourceData::List(ListFields::new("Weekly")))
            .unwrap();

        let use_server = FixedResolution(Resolution::UseServer);
        fx.resolver(&use_server).resolve(&op).await.unwrap();

        let restored = cache.get_visible(&list.id).await.unwrap().unwrap();
        assert_eq!(restored.version, 2);
        assert!(!restored.pending);
        let items = cache.items(&list.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);
        assert!(!items[0].pending);
        assert!(QueueRepository::new(&fx.pool).get(&op.id).await.unwrap().is_none());
    }

    #[test]
    fn test_merge_ties_go_to_remote() {
        let now = Utc::now();
        let local = item_data("Local", 5, true);
        let remote = item_data("Remote", 1, false);
        let payload = OperationPayload::UpdateItem(ItemPatch {
            quantity: Some(5),
            ..Default::default()
        });

        let merged = merge_fields(&local, &remote, &payload, now, now - Duration::hours(1), now);
        assert_eq!(merged, remote);

        let merged = merge_fields(
            &local,
            &remote,
            &payload,
            now + Duration::seconds(1),
            now - Duration::hours(1),
            now,
        );
        assert_eq!(merged, item_data("Remote", 5, false));
    }
}
