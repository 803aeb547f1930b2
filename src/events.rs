//! Sync event bus
//!
//! Broadcast channel fanning engine events out to any number of subscribers.
//! Dropping a [`Subscription`] (or calling `unsubscribe`) detaches it.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::conflict::Resolution;
use crate::queue::Operation;
use crate::sync::SyncState;

const DEFAULT_CAPACITY: usize = 256;

/// Something observable happened in the sync engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    StateChanged {
        state: SyncState,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        processed_count: usize,
    },
    /// The remote confirmed the operation; it left the queue
    OperationSettled {
        operation: Operation,
    },
    /// The operation was parked as failed or dropped as terminal
    OperationFailed {
        operation: Operation,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        operation_id: String,
        resource_id: String,
        resolution: Resolution,
        automatic: bool,
    },
    ReachabilityChanged {
        reachable: bool,
    },
}

/// Publish side of the event stream
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no subscribers is fine
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive side of the event stream
pub struct Subscription {
    rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Event subscriber lagged, skipped {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(SyncEvent::ReachabilityChanged { reachable: true });

        assert!(matches!(
            a.recv().await,
            Some(SyncEvent::ReachabilityChanged { reachable: true })
        ));
        assert!(matches!(
            b.try_recv(),
            Some(SyncEvent::ReachabilityChanged { reachable: true })
        ));
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        // No subscribers left, publishing is still fine
        bus.publish(SyncEvent::Completed { processed_count: 0 });
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(SyncEvent::Progress { current: 1, total: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "progress", "current": 1, "total": 3}));

        let json = serde_json::to_value(SyncEvent::Completed { processed_count: 2 }).unwrap();
        assert_eq!(json["processedCount"], 2);
    }
}
