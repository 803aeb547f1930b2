//! Conflict resolution types

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::cache::{ResourceData, ResourceRecord};
use crate::queue::Operation;
use crate::remote::RemoteRecord;

/// Outcome chosen for a stale operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Resubmit the local intent on top of the remote version
    UseLocal,
    /// Adopt the remote state and drop the operation
    UseServer,
    /// Field-by-field merge, later modification wins
    Merge,
    /// Drop the operation and keep the cache as it is
    Cancel,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::UseLocal => "use_local",
            Resolution::UseServer => "use_server",
            Resolution::Merge => "merge",
            Resolution::Cancel => "cancel",
        }
    }
}

/// What the user meant the resource to look like
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "intent", content = "data")]
pub enum LocalIntent {
    Write(ResourceData),
    Remove,
}

/// Everything a presentation layer needs to ask the user about a conflict
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictContext {
    pub operation: Operation,
    pub local: LocalIntent,
    /// `None` when the remote no longer has the resource
    pub remote: Option<RemoteRecord>,
    /// The cached record the local intent was built on
    pub base: Option<ResourceRecord>,
    /// Semantic fields where local and remote disagree
    pub differing_fields: Vec<&'static str>,
    pub allowed: Vec<Resolution>,
}

impl ConflictContext {
    pub fn allows(&self, resolution: Resolution) -> bool {
        self.allowed.contains(&resolution)
    }

    pub fn remote_deleted(&self) -> bool {
        self.remote.is_none()
    }
}

/// A pending question to the presentation layer
#[derive(Debug)]
pub struct ResolutionRequest {
    pub context: ConflictContext,
    pub responder: oneshot::Sender<Resolution>,
}

impl ResolutionRequest {
    /// Answer the request; false if the resolver stopped waiting
    pub fn respond(self, resolution: Resolution) -> bool {
        self.responder.send(resolution).is_ok()
    }
}
