//! Sync context
//!
//! Owns the lifecycle of the sync core: the reachability loop, the listener
//! that drains on reconnect, and the orchestrator. Mutation entry points and
//! cache reads live in [`mutations`].

mod mutations;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::{DeferResolution, ResolutionHandler};
use crate::error::Result;
use crate::events::{EventBus, Subscription};
use crate::queue::QueueRepository;
use crate::reachability::ReachabilityMonitor;
use crate::remote::{HealthProbe, RemoteApi};
use crate::sync::{DrainReport, SyncOrchestrator, SyncState, SyncStatus};

/// Entry point of the sync core
pub struct SyncContext {
    pool: SqlitePool,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    monitor: ReachabilityMonitor,
    orchestrator: SyncOrchestrator,
    config: SyncConfig,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`SyncContext`]
pub struct SyncContextBuilder {
    pool: SqlitePool,
    remote: Arc<dyn RemoteApi>,
    probe: Arc<dyn HealthProbe>,
    handler: Arc<dyn ResolutionHandler>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: SyncConfig,
}

impl SyncContextBuilder {
    /// Who decides conflicts the resolver cannot settle alone
    pub fn resolution_handler(mut self, handler: Arc<dyn ResolutionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SyncContext {
        let monitor = ReachabilityMonitor::new(
            self.probe,
            self.events.clone(),
            self.config.probe_timeout,
            self.config.probe_interval,
        );
        let orchestrator = SyncOrchestrator::new(
            self.pool.clone(),
            self.remote.clone(),
            self.handler,
            self.clock.clone(),
            monitor.clone(),
            self.events.clone(),
            self.config.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        SyncContext {
            pool: self.pool,
            remote: self.remote,
            clock: self.clock,
            events: self.events,
            monitor,
            orchestrator,
            config: self.config,
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl SyncContext {
    pub fn builder(
        pool: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn HealthProbe>,
    ) -> SyncContextBuilder {
        SyncContextBuilder {
            pool,
            remote,
            probe,
            handler: Arc::new(DeferResolution),
            clock: Arc::new(SystemClock),
            events: EventBus::default(),
            config: SyncConfig::default(),
        }
    }

    /// Recover from the previous run and start the background loops
    pub async fn start(&self) -> Result<()> {
        let queue = self.queue();

        let recovered = queue.recover_in_flight().await?;
        if recovered > 0 {
            tracing::info!("Recovered {} operation(s) left in flight", recovered);
        }

        if let Some(after) = self.config.purge_failed_after {
            let cutoff = self.clock.now()
                - chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
            let purged = queue.purge_failed(cutoff).await?;
            if purged > 0 {
                tracing::info!("Purged {} failed operation(s) older than {}", purged, cutoff);
            }
        }

        let mut tasks = vec![self.monitor.spawn()];

        let mut reachable = self.monitor.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let orchestrator = self.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = reachable.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *reachable.borrow_and_update() {
                            orchestrator.trigger();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
        self.tasks.lock().extend(tasks);

        if self.monitor.check_now().await {
            self.orchestrator.trigger();
        }

        let counts = queue.counts().await?;
        tracing::info!(
            "Sync context started ({} pending, {} failed)",
            counts.pending,
            counts.failed
        );
        Ok(())
    }

    /// Stop background work; an operation already on the wire completes first
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.monitor.shutdown();
        self.orchestrator.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Sync context shut down");
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn reachability(&self) -> &ReachabilityMonitor {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn state(&self) -> SyncState {
        self.orchestrator.state()
    }

    /// Platform connectivity changed
    pub async fn on_connectivity_change(&self, link_up: bool) {
        self.monitor.on_connectivity_change(link_up).await;
    }

    /// Drain now and wait for the result
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.orchestrator.drain().await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let queue = self.queue();
        let counts = queue.counts().await?;

        let last_error = match self.orchestrator.last_error() {
            Some(error) => Some(error),
            None if counts.failed > 0 => queue
                .list_failed()
                .await?
                .into_iter()
                .rev()
                .find_map(|op| op.last_error),
            None => None,
        };

        Ok(SyncStatus {
            state: self.orchestrator.state(),
            reachable: self.monitor.is_reachable(),
            last_sync: self.orchestrator.last_sync(),
            pending_changes: counts.pending + counts.in_flight,
            failed_changes: counts.failed,
            last_error,
        })
    }

    /// Delete failed operations queued before `older_than`
    pub async fn purge_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.queue().purge_failed(older_than).await
    }

    fn queue(&self) -> QueueRepository<'_> {
        QueueRepository::with_clock(&self.pool, &*self.clock)
    }
}
