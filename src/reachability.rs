//! Remote reachability tracking
//!
//! Combines the platform link signal with an active health probe. The current
//! answer lives in a `watch` channel; only real transitions are published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{EventBus, SyncEvent};
use crate::remote::HealthProbe;

struct Inner {
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
    reachable: watch::Sender<bool>,
    link_up: AtomicBool,
    probe_timeout: Duration,
    probe_interval: Duration,
    shutdown: watch::Sender<bool>,
}

/// Tracks whether the remote can currently be reached
#[derive(Clone)]
pub struct ReachabilityMonitor {
    inner: Arc<Inner>,
}

impl ReachabilityMonitor {
    /// A monitor that starts out unreachable
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        events: EventBus,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        let (reachable, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                probe,
                events,
                reachable,
                link_up: AtomicBool::new(true),
                probe_timeout,
                probe_interval,
                shutdown,
            }),
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.inner.reachable.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.reachable.subscribe()
    }

    /// Probe the remote now and record the answer
    pub async fn check_now(&self) -> bool {
        if !self.inner.link_up.load(Ordering::SeqCst) {
            self.set(false);
            return false;
        }

        let reachable = tokio::time::timeout(self.inner.probe_timeout, self.inner.probe.probe())
            .await
            .unwrap_or_else(|_| {
                tracing::debug!("Health probe timed out after {:?}", self.inner.probe_timeout);
                false
            });

        self.set(reachable);
        reachable
    }

    /// Platform connectivity changed
    pub async fn on_connectivity_change(&self, link_up: bool) {
        self.inner.link_up.store(link_up, Ordering::SeqCst);
        if link_up {
            self.check_now().await;
        } else {
            self.set(false);
        }
    }

    /// A remote call failed at transport level
    pub fn report_unreachable(&self) {
        self.set(false);
    }

    /// Resolve once the remote is reachable, `false` if `timeout` elapses first
    pub async fn wait_for_online(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.subscribe();
        let online = async move { rx.wait_for(|reachable| *reachable).await.is_ok() };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, online).await.unwrap_or(false),
            None => online.await,
        }
    }

    /// Start the background loop re-probing while the remote is unreachable
    pub fn spawn(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if !monitor.is_reachable() && monitor.inner.link_up.load(Ordering::SeqCst) {
                    monitor.check_now().await;
                }

                tokio::select! {
                    _ = tokio::time::sleep(monitor.inner.probe_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Reachability loop stopped");
        })
    }

    /// Stop the background loop
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn set(&self, reachable: bool) {
        let changed = self.inner.reachable.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });

        if changed {
            if reachable {
                tracing::info!("Remote is reachable");
            } else {
                tracing::warn!("Remote is unreachable");
            }
            self.inner
                .events
                .publish(SyncEvent::ReachabilityChanged { reachable });
        }
    }
}
