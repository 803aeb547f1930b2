//! Queue drain orchestration
//!
//! Pops due operations one at a time in FIFO order, hands them to the remote
//! and settles the outcome: success updates the cache, conflicts go to the
//! resolver, transient failures back off, unreachability pauses the drain.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};

use super::types::{DrainReport, SyncState};
use crate::cache::{is_provisional_id, CacheRepository, ResourceData, ResourceRecord};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::conflict::{ConflictOutcome, ConflictResolver, ResolutionHandler};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{
    ItemOrder, Operation, OperationKind, OperationPayload, OperationStatus, QueueRepository,
    ResourceKind,
};
use crate::reachability::ReachabilityMonitor;
use crate::remote::{RemoteApi, RemoteRecord};

/// What the remote confirmed
enum Applied {
    Record(RemoteRecord),
    Deleted,
    Reordered(Vec<ItemOrder>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Pause,
}

struct Inner {
    pool: SqlitePool,
    remote: Arc<dyn RemoteApi>,
    handler: Arc<dyn ResolutionHandler>,
    clock: Arc<dyn Clock>,
    monitor: ReachabilityMonitor,
    events: EventBus,
    config: SyncConfig,
    state: watch::Sender<SyncState>,
    draining: AtomicBool,
    rerun: AtomicBool,
    stopped: AtomicBool,
    drained: Notify,
    local_writes: Mutex<()>,
    last_sync: parking_lot::Mutex<Option<chrono::DateTime<Utc>>>,
    last_error: parking_lot::Mutex<Option<String>>,
}

/// Releases the single-flight flag
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-flight drain loop over the operation queue
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        handler: Arc<dyn ResolutionHandler>,
        clock: Arc<dyn Clock>,
        monitor: ReachabilityMonitor,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);

        Self {
            inner: Arc::new(Inner {
                pool,
                remote,
                handler,
                clock,
                monitor,
                events,
                config,
                state,
                draining: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                drained: Notify::new(),
                local_writes: Mutex::new(()),
                last_sync: parking_lot::Mutex::new(None),
                last_error: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Last time the remote confirmed an operation
    pub fn last_sync(&self) -> Option<chrono::DateTime<Utc>> {
        *self.inner.last_sync.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Serializes local cache/queue writes against outcome application
    pub(crate) async fn lock_local_writes(&self) -> MutexGuard<'_, ()> {
        self.inner.local_writes.lock().await
    }

    /// Start a drain in the background
    pub fn trigger(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let _ = orchestrator.drain().await;
        });
    }

    /// Drain the queue now.
    ///
    /// Returns a skipped report when the remote is unreachable, the orchestrator
    /// is shut down, or another drain holds the lock. In the last case the
    /// running drain takes one more pass over the queue before it finishes.
    pub async fn drain(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        let skipped = DrainReport {
            skipped: true,
            ..Default::default()
        };

        if inner.stopped.load(Ordering::SeqCst) {
            return Ok(skipped);
        }
        if !inner.monitor.is_reachable() {
            tracing::debug!("Remote unreachable, not draining");
            return Ok(skipped);
        }
        if inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            inner.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("Drain already running");
            return Ok(skipped);
        }

        let guard = DrainGuard(&inner.draining);
        self.set_state(SyncState::Draining);

        let mut report = DrainReport::default();
        let result = loop {
            if let Err(e) = self.run(&mut report).await {
                break Err(e);
            }
            if report.paused
                || inner.stopped.load(Ordering::SeqCst)
                || !inner.rerun.swap(false, Ordering::SeqCst)
            {
                break Ok(());
            }
        };

        match &result {
            Ok(()) => {
                *inner.last_error.lock() = None;
                self.set_state(SyncState::Idle);
                if !report.paused {
                    inner.events.publish(SyncEvent::Completed {
                        processed_count: report.processed,
                    });
                }
                tracing::info!(
                    "Drain finished: {} processed, {} synced, {} retried, {} failed, {} conflicts{}",
                    report.processed,
                    report.succeeded,
                    report.retried,
                    report.failed,
                    report.conflicts,
                    if report.paused { " (paused)" } else { "" }
                );
            }
            Err(e) => {
                tracing::error!("Drain stopped: {}", e);
                *inner.last_error.lock() = Some(e.to_string());
                self.set_state(SyncState::Error);
            }
        }

        drop(guard);
        inner.drained.notify_waiters();

        // A trigger may have landed between the last pass and releasing the lock
        if result.is_ok() && !report.paused && inner.rerun.swap(false, Ordering::SeqCst) {
            self.trigger();
        }

        result.map(|()| report)
    }

    /// Stop scheduling drains and wait for a running one to finish its operation
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        loop {
            let drained = self.inner.drained.notified();
            if !self.is_draining() {
                break;
            }
            drained.await;
        }
        tracing::info!("Sync orchestrator stopped");
    }

    fn set_state(&self, state: SyncState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            tracing::debug!("Sync state: {}", state.as_str());
            self.inner.events.publish(SyncEvent::StateChanged { state });
        }
    }

    fn queue(&self) -> QueueRepository<'_> {
        QueueRepository::with_clock(&self.inner.pool, &*self.inner.clock)
    }

    fn cache(&self) -> CacheRepository<'_> {
        CacheRepository::new(&self.inner.pool)
    }

    /// One pass: process due operations until none is left
    async fn run(&self, report: &mut DrainReport) -> Result<()> {
        let inner = &self.inner;
        let queue = self.queue();

        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            if !inner.monitor.is_reachable() {
                report.paused = true;
                break;
            }

            let due = queue.due(inner.clock.now()).await?;
            let unsynced: HashSet<String> = queue.unsynced_creates().await?.into_iter().collect();
            let remaining = due.len();
            let Some(op) = due.into_iter().find(|op| !is_blocked(op, &unsynced)) else {
                break;
            };

            inner.events.publish(SyncEvent::Progress {
                current: report.processed + 1,
                total: report.processed + remaining,
            });

            if !queue.mark_in_flight(&op.id).await? {
                continue;
            }

            tracing::debug!(
                "Sending {} {} {} (base version {}, attempt {})",
                op.kind.as_str(),
                op.resource_kind.as_str(),
                op.resource_id,
                op.base_version,
                op.retry_count + 1
            );

            let result = self.dispatch(&op).await;
            report.processed += 1;

            let flow = match self.settle(&op, result, report).await {
                Ok(flow) => flow,
                Err(e) => {
                    if let Err(revert) = queue.mark_pending(&op.id).await {
                        tracing::error!("Could not return {} to the queue: {}", op.id, revert);
                    }
                    return Err(e);
                }
            };

            if flow == Flow::Pause {
                report.paused = true;
                break;
            }

            if !inner.config.inter_op_delay.is_zero() {
                tokio::time::sleep(inner.config.inter_op_delay).await;
            }
        }

        Ok(())
    }

    /// Call the remote for one operation, bounded by the request timeout
    async fn dispatch(&self, op: &Operation) -> Result<Applied> {
        let remote = &*self.inner.remote;

        let call = async {
            match &op.payload {
                OperationPayload::CreateList(fields) => remote
                    .create(ResourceKind::List, None, &ResourceData::List(fields.clone()))
                    .await
                    .map(Applied::Record),
                OperationPayload::CreateItem(fields) => remote
                    .create(
                        ResourceKind::Item,
                        op.parent_id.as_deref(),
                        &ResourceData::Item(fields.clone()),
                    )
                    .await
                    .map(Applied::Record),
                OperationPayload::UpdateList(_) | OperationPayload::UpdateItem(_) => {
                    let patch = op.payload.patch().ok_or_else(|| {
                        SyncError::Internal(format!("update {} without a patch", op.id))
                    })?;
                    remote
                        .update(op.resource_kind, &op.resource_id, &patch, op.base_version)
                        .await
                        .map(Applied::Record)
                }
                OperationPayload::DeleteList | OperationPayload::DeleteItem => remote
                    .delete(op.resource_kind, &op.resource_id, op.base_version)
                    .await
                    .map(|()| Applied::Deleted),
                OperationPayload::ReorderItems { orders } => remote
                    .reorder(&op.resource_id, orders)
                    .await
                    .map(Applied::Reordered),
            }
        };

        match tokio::time::timeout(self.inner.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn settle(
        &self,
        op: &Operation,
        result: Result<Applied>,
        report: &mut DrainReport,
    ) -> Result<Flow> {
        match result {
            Ok(applied) => {
                self.apply_success(op, applied).await?;
                report.succeeded += 1;
                Ok(Flow::Continue)
            }
            Err(SyncError::NotFound(message)) => match op.kind {
                OperationKind::Delete => {
                    tracing::debug!("{} already gone remotely", op.resource_id);
                    self.apply_success(op, Applied::Deleted).await?;
                    report.succeeded += 1;
                    Ok(Flow::Continue)
                }
                OperationKind::Update => self.resolve_conflict(op, report).await,
                OperationKind::Create | OperationKind::Reorder => {
                    self.drop_terminal(op, &format!("Not found: {}", message)).await?;
                    report.failed += 1;
                    Ok(Flow::Continue)
                }
            },
            Err(SyncError::VersionConflict { .. }) => self.resolve_conflict(op, report).await,
            Err(SyncError::Unreachable(message)) => {
                tracing::warn!("Remote unreachable while sending {}: {}", op.id, message);
                self.queue().mark_pending(&op.id).await?;
                self.inner.monitor.report_unreachable();
                Ok(Flow::Pause)
            }
            Err(e) if e.is_retryable() => {
                if e.is_transport() {
                    let monitor = self.inner.monitor.clone();
                    tokio::spawn(async move {
                        monitor.check_now().await;
                    });
                }
                self.retry_later(op, &e, report).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::warn!("Operation {} rejected: {}", op.id, e);
                let message = e.to_string();
                self.queue().mark_failed(&op.id, None, &message).await?;
                self.publish_failed(op, None, message);
                report.failed += 1;
                Ok(Flow::Continue)
            }
        }
    }

    async fn resolve_conflict(&self, op: &Operation, report: &mut DrainReport) -> Result<Flow> {
        report.conflicts += 1;

        if self.queue().get(&op.id).await?.is_none() {
            tracing::debug!("Conflicting operation {} was superseded", op.id);
            return Ok(Flow::Continue);
        }

        let inner = &self.inner;
        let resolver = ConflictResolver::new(
            &inner.pool,
            &*inner.remote,
            &*inner.handler,
            &*inner.clock,
            &inner.events,
        )
        .with_write_lock(&inner.local_writes);

        if let ConflictOutcome::Failed(reason) = resolver.resolve(op).await? {
            self.publish_failed(op, None, reason);
            report.failed += 1;
        }
        Ok(Flow::Continue)
    }

    async fn retry_later(
        &self,
        op: &Operation,
        error: &SyncError,
        report: &mut DrainReport,
    ) -> Result<()> {
        let policy = self.inner.config.retry;
        let failures = op.retry_count + 1;
        let message = error.to_string();

        if policy.is_exhausted(failures) {
            tracing::warn!(
                "Operation {} failed {} times, giving up: {}",
                op.id,
                failures,
                message
            );
            self.queue()
                .mark_failed(&op.id, Some(failures), &message)
                .await?;
            self.publish_failed(op, Some(failures), message);
            report.failed += 1;
            return Ok(());
        }

        let delay = policy.delay_for(failures);
        let next_attempt_at = self.inner.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

        tracing::warn!(
            "Operation {} failed ({}), retry {} in {:?}",
            op.id,
            message,
            failures,
            delay
        );
        self.queue()
            .reschedule(&op.id, failures, next_attempt_at, &message)
            .await?;
        report.retried += 1;
        self.schedule_trigger(delay);
        Ok(())
    }

    /// Trigger a drain once `delay` has passed
    fn schedule_trigger(&self, delay: Duration) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                SyncOrchestrator { inner }.trigger();
            }
        });
    }

    /// Fold a confirmed outcome into the cache and drop the operation
    async fn apply_success(&self, op: &Operation, applied: Applied) -> Result<()> {
        let _writes = self.lock_local_writes().await;
        let queue = self.queue();
        let cache = self.cache();

        let successors: Vec<Operation> = queue
            .ops_for_resource(op.resource_kind, &op.resource_id)
            .await?
            .into_iter()
            .filter(|other| other.id != op.id)
            .collect();

        match applied {
            Applied::Record(record) => {
                if op.kind == OperationKind::Create && record.id != op.resource_id {
                    tracing::debug!("{} is now {}", op.resource_id, record.id);
                    cache.rename_id(&op.resource_id, &record.id).await?;
                    queue.rewrite_resource_id(&op.resource_id, &record.id).await?;
                }

                if successors.is_empty() {
                    let mut confirmed = ResourceRecord::confirmed(&record);
                    self.keep_queued_order(&mut confirmed).await?;
                    cache.put(&confirmed).await?;
                } else {
                    // Newer local edits are queued; keep their optimistic fields
                    let mut cached = cache
                        .get(&record.id)
                        .await?
                        .unwrap_or_else(|| ResourceRecord::confirmed(&record));
                    cached.version = record.version;
                    cached.updated_at = record.updated_at;
                    cached.parent_id = record.parent_id.clone();
                    cached.provisional = false;
                    cached.pending = true;
                    cache.put(&cached).await?;

                    for successor in &successors {
                        if matches!(successor.kind, OperationKind::Update | OperationKind::Delete) {
                            queue.rebase(&successor.id, record.version).await?;
                        }
                    }
                }
            }
            Applied::Deleted => {
                cache.remove(&op.resource_id).await?;
                if op.resource_kind == ResourceKind::List {
                    cache.remove_children(&op.resource_id).await?;
                    queue.remove_for_parent(&op.resource_id).await?;
                }
            }
            Applied::Reordered(orders) => {
                cache.apply_orders(&op.resource_id, &orders).await?;
            }
        }

        // Last, so a failed cache write leaves the operation to be retried
        queue.remove(&op.id).await?;

        *self.inner.last_sync.lock() = Some(self.inner.clock.now());

        let mut settled = op.clone();
        settled.status = OperationStatus::Done;
        self.inner
            .events
            .publish(SyncEvent::OperationSettled { operation: settled });
        Ok(())
    }

    /// An item's order from the remote is stale while its list has a reorder queued
    async fn keep_queued_order(&self, confirmed: &mut ResourceRecord) -> Result<()> {
        let Some(list_id) = confirmed.parent_id.clone() else {
            return Ok(());
        };
        let ResourceData::Item(fields) = &mut confirmed.data else {
            return Ok(());
        };

        let reorder_queued = self
            .queue()
            .ops_for_resource(ResourceKind::Item, &list_id)
            .await?
            .iter()
            .any(|other| other.kind == OperationKind::Reorder);
        if !reorder_queued {
            return Ok(());
        }

        let cached = self.cache().get(&confirmed.id).await?;
        if let Some(local) = cached.as_ref().and_then(|c| c.item_fields()) {
            fields.order = local.order;
        }
        Ok(())
    }

    /// Drop an operation the remote can never accept
    async fn drop_terminal(&self, op: &Operation, reason: &str) -> Result<()> {
        let _writes = self.lock_local_writes().await;
        tracing::warn!("Dropping {} {}: {}", op.kind.as_str(), op.resource_id, reason);

        let queue = self.queue();
        let cache = self.cache();
        queue.remove(&op.id).await?;

        if op.kind == OperationKind::Create {
            cache.remove(&op.resource_id).await?;
            if op.resource_kind == ResourceKind::List {
                queue.remove_for_parent(&op.resource_id).await?;
                cache.remove_children(&op.resource_id).await?;
            }
        }

        let mut dropped = op.clone();
        dropped.status = OperationStatus::Failed;
        dropped.last_error = Some(reason.to_string());
        self.inner.events.publish(SyncEvent::OperationFailed {
            operation: dropped,
            error: reason.to_string(),
        });
        Ok(())
    }

    fn publish_failed(&self, op: &Operation, retry_count: Option<u32>, error: String) {
        let mut failed = op.clone();
        failed.status = OperationStatus::Failed;
        if let Some(count) = retry_count {
            failed.retry_count = count;
        }
        failed.last_error = Some(error.clone());
        self.inner
            .events
            .publish(SyncEvent::OperationFailed { operation: failed, error });
    }
}

/// Operations on a resource whose create has not reached the remote wait for it
fn is_blocked(op: &Operation, unsynced_creates: &HashSet<String>) -> bool {
    let waits_on = |id: &str| is_provisional_id(id) && unsynced_creates.contains(id);

    let parent_blocked = op
        .parent_id
        .as_deref()
        .map(|parent| parent != op.resource_id && waits_on(parent))
        .unwrap_or(false);

    match op.kind {
        OperationKind::Create => parent_blocked,
        _ => parent_blocked || waits_on(&op.resource_id),
    }
}
