//! End-to-end sync scenarios against the in-process remote

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use listsync::db::{create_memory_pool, create_pool};
use listsync::{
    ConflictContext, InMemoryRemote, ItemFields, ItemPatch, ListFields, ListPatch,
    OperationKind, Resolution, ResolutionHandler, ResourceData, SyncConfig, SyncContext,
    SyncEvent,
};

fn test_config() -> SyncConfig {
    SyncConfig {
        inter_op_delay: Duration::ZERO,
        probe_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn context(pool: sqlx::SqlitePool, remote: &InMemoryRemote) -> SyncContext {
    SyncContext::builder(pool, Arc::new(remote.clone()), Arc::new(remote.clone()))
        .config(test_config())
        .build()
}

async fn go_offline(ctx: &SyncContext, remote: &InMemoryRemote) {
    remote.set_reachable(false);
    assert!(!ctx.reachability().check_now().await);
}

async fn go_online(ctx: &SyncContext, remote: &InMemoryRemote) {
    remote.set_reachable(true);
    assert!(ctx.reachability().check_now().await);
}

/// Create a list and sync it so the cache holds the confirmed record
async fn synced_list(ctx: &SyncContext, remote: &InMemoryRemote, name: &str) -> String {
    go_online(ctx, remote).await;
    ctx.create_list(ListFields::new(name)).await.unwrap();
    // Settle any drain the mutation kicked off, then make sure nothing is left
    wait_until_empty(ctx).await;
    go_offline(ctx, remote).await;

    let lists = ctx.lists().await.unwrap();
    let list = lists
        .into_iter()
        .find(|l| l.list_fields().map(|f| f.name.as_str()) == Some(name))
        .unwrap();
    assert!(!list.provisional);
    list.id
}

async fn wait_until_empty(ctx: &SyncContext) {
    for _ in 0..200 {
        if !ctx.orchestrator().is_draining() {
            ctx.sync_now().await.unwrap();
            if ctx.pending_operations().await.unwrap().is_empty() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue did not drain");
}

#[tokio::test]
async fn test_rapid_edits_collapse_to_one_update() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let ctx = context(pool, &remote);
    let list_id = synced_list(&ctx, &remote, "Groceries").await;

    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("A".to_string()),
            description: Some("weekly".to_string()),
        },
    )
    .await
    .unwrap();
    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("B".to_string()),
            description: None,
        },
    )
    .await
    .unwrap();

    let pending = ctx.pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Update);
    assert_eq!(pending[0].base_version, 1);

    go_online(&ctx, &remote).await;
    let report = ctx.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let server = remote.get(&list_id).unwrap();
    assert_eq!(server.version, 2);
    assert_eq!(
        server.data,
        ResourceData::List(ListFields {
            name: "B".to_string(),
            description: "weekly".to_string(),
        })
    );

    let cached = ctx.get(&list_id).await.unwrap().unwrap();
    assert_eq!(cached.version, 2);
    assert!(!cached.pending);
}

#[tokio::test]
async fn test_offline_create_lands_when_reachable() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    remote.set_reachable(false);
    let ctx = context(pool, &remote);

    let list = ctx.create_list(ListFields::new("Groceries")).await.unwrap();
    ctx.create_item(&list.id, ItemFields::new("Milk"))
        .await
        .unwrap();

    let cached = ctx.get(&list.id).await.unwrap().unwrap();
    assert!(cached.provisional);
    assert!(cached.pending);
    assert_eq!(remote.call_count(), 0);

    go_online(&ctx, &remote).await;
    let report = ctx.sync_now().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(ctx.pending_operations().await.unwrap().is_empty());

    let lists = ctx.lists().await.unwrap();
    assert_eq!(lists.len(), 1);
    let list = &lists[0];
    assert!(!list.provisional);
    assert!(!list.pending);
    assert_eq!(remote.get(&list.id).unwrap().version, list.version);

    let items = ctx.items(&list.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].parent_id.as_deref(), Some(list.id.as_str()));
    assert!(remote.get(&items[0].id).is_some());
}

#[tokio::test]
async fn test_metadata_only_conflict_auto_merges() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let ctx = context(pool, &remote);
    let list_id = synced_list(&ctx, &remote, "Groceries").await;

    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("Weekly".to_string()),
            description: None,
        },
    )
    .await
    .unwrap();

    // Another client made the same edit and touched it again
    let same = ResourceData::List(ListFields::new("Weekly"));
    remote.edit(&list_id, same.clone()).unwrap();
    remote.edit(&list_id, same).unwrap();

    let mut events = ctx.subscribe();
    go_online(&ctx, &remote).await;
    let report = ctx.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.failed, 0);

    assert!(ctx.pending_operations().await.unwrap().is_empty());
    let cached = ctx.get(&list_id).await.unwrap().unwrap();
    assert_eq!(cached.version, 3);
    assert!(!cached.pending);

    let mut automatic = false;
    while let Some(event) = events.try_recv() {
        if let SyncEvent::ConflictResolved {
            resolution,
            automatic: auto,
            ..
        } = event
        {
            assert_eq!(resolution, Resolution::Merge);
            automatic = auto;
        }
    }
    assert!(automatic);
}

/// Answers with a fixed resolution and remembers what it was offered
struct RecordingHandler {
    answer: Resolution,
    offered: Mutex<Vec<Vec<Resolution>>>,
}

#[async_trait]
impl ResolutionHandler for RecordingHandler {
    async fn resolve(&self, context: &ConflictContext) -> Option<Resolution> {
        self.offered.lock().push(context.allowed.clone());
        Some(self.answer)
    }
}

#[tokio::test]
async fn test_update_on_remotely_deleted_resource() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let handler = Arc::new(RecordingHandler {
        answer: Resolution::UseServer,
        offered: Mutex::new(Vec::new()),
    });
    let ctx = SyncContext::builder(pool, Arc::new(remote.clone()), Arc::new(remote.clone()))
        .config(test_config())
        .resolution_handler(handler.clone())
        .build();

    let list_id = synced_list(&ctx, &remote, "Groceries").await;
    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("Weekly".to_string()),
            description: None,
        },
    )
    .await
    .unwrap();
    remote.remove(&list_id).unwrap();

    go_online(&ctx, &remote).await;
    ctx.sync_now().await.unwrap();

    let offered = handler.offered.lock().clone();
    assert_eq!(offered, vec![vec![Resolution::UseServer, Resolution::Cancel]]);
    assert!(ctx.get(&list_id).await.unwrap().is_none());
    assert!(ctx.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_use_server_adopts_remote_version() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let handler = Arc::new(RecordingHandler {
        answer: Resolution::UseServer,
        offered: Mutex::new(Vec::new()),
    });
    let ctx = SyncContext::builder(pool, Arc::new(remote.clone()), Arc::new(remote.clone()))
        .config(test_config())
        .resolution_handler(handler)
        .build();

    let list_id = synced_list(&ctx, &remote, "Groceries").await;
    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("Mine".to_string()),
            description: None,
        },
    )
    .await
    .unwrap();
    let theirs = remote
        .edit(&list_id, ResourceData::List(ListFields::new("Theirs")))
        .unwrap();

    go_online(&ctx, &remote).await;
    ctx.sync_now().await.unwrap();

    let cached = ctx.get(&list_id).await.unwrap().unwrap();
    assert_eq!(cached.version, theirs.version);
    assert_eq!(cached.list_fields().unwrap().name, "Theirs");
    assert!(!cached.pending);
    assert!(ctx.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unresolved_conflict_is_parked_and_retryable() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let ctx = context(pool, &remote);
    let list_id = synced_list(&ctx, &remote, "Groceries").await;

    ctx.update_list(
        &list_id,
        ListPatch {
            name: Some("Mine".to_string()),
            description: None,
        },
    )
    .await
    .unwrap();
    remote
        .edit(&list_id, ResourceData::List(ListFields::new("Theirs")))
        .unwrap();

    go_online(&ctx, &remote).await;
    let report = ctx.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = ctx.failed_operations().await.unwrap();
    assert_eq!(failed.len(), 1);
    let status = ctx.status().await.unwrap();
    assert_eq!(status.failed_changes, 1);
    assert!(status
        .last_error
        .unwrap()
        .starts_with("conflict resolution failed"));

    // Giving up the local edit restores the remote state
    assert!(ctx.discard_operation(&failed[0].id).await.unwrap());
    let cached = ctx.get(&list_id).await.unwrap().unwrap();
    assert_eq!(cached.list_fields().unwrap().name, "Theirs");
    assert_eq!(cached.version, 2);
    assert!(ctx.failed_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reorder_and_item_edits_sync() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    remote.set_reachable(false);
    let ctx = context(pool, &remote);

    let list = ctx.create_list(ListFields::new("Groceries")).await.unwrap();
    let milk = ctx
        .create_item(&list.id, ItemFields::new("Milk"))
        .await
        .unwrap();
    let eggs = ctx
        .create_item(
            &list.id,
            ItemFields {
                order: 1,
                ..ItemFields::new("Eggs")
            },
        )
        .await
        .unwrap();
    ctx.reorder_items(
        &list.id,
        vec![
            listsync::ItemOrder {
                id: eggs.id.clone(),
                order: 0,
            },
            listsync::ItemOrder {
                id: milk.id.clone(),
                order: 1,
            },
        ],
    )
    .await
    .unwrap();
    ctx.update_item(
        &milk.id,
        ItemPatch {
            completed: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let names: Vec<String> = ctx
        .items(&list.id)
        .await
        .unwrap()
        .iter()
        .map(|i| i.item_fields().unwrap().name.clone())
        .collect();
    assert_eq!(names, vec!["Eggs", "Milk"]);

    go_online(&ctx, &remote).await;
    wait_until_empty(&ctx).await;

    let lists = ctx.lists().await.unwrap();
    let items = ctx.items(&lists[0].id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| !i.provisional && !i.pending));
    let milk = items
        .iter()
        .find(|i| i.item_fields().unwrap().name == "Milk")
        .unwrap();
    assert!(milk.item_fields().unwrap().completed);
    assert!(remote.get(&milk.id).is_some());
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("listsync.db").display());
    let remote = InMemoryRemote::new();
    remote.set_reachable(false);

    {
        let pool = create_pool(&url).await.unwrap();
        let ctx = context(pool.clone(), &remote);
        ctx.create_list(ListFields::new("Groceries")).await.unwrap();
        ctx.shutdown().await;
        pool.close().await;
    }

    let pool = create_pool(&url).await.unwrap();
    let ctx = context(pool, &remote);
    let pending = ctx.pending_operations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Create);
    assert_eq!(ctx.lists().await.unwrap().len(), 1);

    // Coming back online drains what the previous run left behind
    let mut events = ctx.subscribe();
    remote.set_reachable(true);
    ctx.start().await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let SyncEvent::Completed { processed_count } = event {
                if processed_count > 0 {
                    return processed_count;
                }
            }
        }
        0
    })
    .await
    .unwrap();
    assert_eq!(completed, 1);
    assert!(ctx.pending_operations().await.unwrap().is_empty());
    assert_eq!(remote.len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_link_loss_stops_drains() {
    let pool = create_memory_pool().await.unwrap();
    let remote = InMemoryRemote::new();
    let ctx = context(pool, &remote);
    ctx.start().await.unwrap();
    assert!(ctx.status().await.unwrap().reachable);

    ctx.on_connectivity_change(false).await;
    assert!(!ctx.reachability().is_reachable());

    ctx.create_list(ListFields::new("Groceries")).await.unwrap();
    let report = ctx.sync_now().await.unwrap();
    assert!(report.skipped);
    assert_eq!(ctx.pending_operations().await.unwrap().len(), 1);

    ctx.on_connectivity_change(true).await;
    assert!(ctx.reachability().is_reachable());
    wait_until_empty(&ctx).await;
    assert_eq!(remote.len(), 1);

    ctx.shutdown().await;
}
