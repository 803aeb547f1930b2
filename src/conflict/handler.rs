//! Sources of conflict decisions

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::types::{ConflictContext, Resolution, ResolutionRequest};

/// Decides how a conflict is resolved.
///
/// Returning `None` leaves the operation parked as failed.
#[async_trait]
pub trait ResolutionHandler: Send + Sync {
    async fn resolve(&self, context: &ConflictContext) -> Option<Resolution>;
}

/// Always answers with the same outcome
#[derive(Debug, Clone, Copy)]
pub struct FixedResolution(pub Resolution);

#[async_trait]
impl ResolutionHandler for FixedResolution {
    async fn resolve(&self, _context: &ConflictContext) -> Option<Resolution> {
        Some(self.0)
    }
}

/// Never decides; conflicts wait for manual handling
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferResolution;

#[async_trait]
impl ResolutionHandler for DeferResolution {
    async fn resolve(&self, _context: &ConflictContext) -> Option<Resolution> {
        None
    }
}

/// Asks a presentation layer over a channel and waits for the answer
pub struct PromptResolutionHandler {
    requests: mpsc::Sender<ResolutionRequest>,
    timeout: Duration,
}

impl PromptResolutionHandler {
    /// Create the handler and the receiving end the presentation layer listens on
    pub fn channel(timeout: Duration) -> (Self, mpsc::Receiver<ResolutionRequest>) {
        let (requests, rx) = mpsc::channel(8);
        (Self { requests, timeout }, rx)
    }
}

#[async_trait]
impl ResolutionHandler for PromptResolutionHandler {
    async fn resolve(&self, context: &ConflictContext) -> Option<Resolution> {
        let (responder, answer) = oneshot::channel();
        let request = ResolutionRequest {
            context: context.clone(),
            responder,
        };

        if self.requests.send(request).await.is_err() {
            tracing::warn!("No one is listening for conflict prompts");
            return None;
        }

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(resolution)) => Some(resolution),
            Ok(Err(_)) => {
                tracing::warn!(
                    "Conflict prompt for {} dropped without an answer",
                    context.operation.resource_id
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Conflict prompt for {} timed out after {:?}",
                    context.operation.resource_id,
                    self.timeout
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::LocalIntent;
    use crate::queue::{Operation, OperationKind, OperationPayload, OperationStatus, ResourceKind};
    use chrono::Utc;

    fn context() -> ConflictContext {
        ConflictContext {
            operation: Operation {
                id: "op-1".to_string(),
                created_at: Utc::now(),
                kind: OperationKind::Delete,
                resource_kind: ResourceKind::List,
                resource_id: "list-1".to_string(),
                parent_id: None,
                payload: OperationPayload::DeleteList,
                base_version: 1,
                retry_count: 0,
                status: OperationStatus::InFlight,
                last_error: None,
                next_attempt_at: None,
            },
            local: LocalIntent::Remove,
            remote: None,
            base: None,
            differing_fields: vec![],
            allowed: vec![Resolution::UseServer, Resolution::Cancel],
        }
    }

    #[tokio::test]
    async fn test_prompt_round_trip() {
        let (handler, mut requests) = PromptResolutionHandler::channel(Duration::from_secs(5));

        let ui = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert!(request.context.remote_deleted());
            assert!(request.respond(Resolution::Cancel));
        });

        assert_eq!(handler.resolve(&context()).await, Some(Resolution::Cancel));
        ui.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_times_out() {
        let (handler, _requests) = PromptResolutionHandler::channel(Duration::from_secs(30));
        assert_eq!(handler.resolve(&context()).await, None);
    }

    #[tokio::test]
    async fn test_prompt_without_listener() {
        let (handler, requests) = PromptResolutionHandler::channel(Duration::from_secs(30));
        drop(requests);
        assert_eq!(handler.resolve(&context()).await, None);
    }

    #[tokio::test]
    async fn test_fixed_and_deferred() {
        let ctx = context();
        assert_eq!(
            FixedResolution(Resolution::UseServer).resolve(&ctx).await,
            Some(Resolution::UseServer)
        );
        assert_eq!(DeferResolution.resolve(&ctx).await, None);
    }
}
