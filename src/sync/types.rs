//! Sync engine types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Drain state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
    /// The last drain stopped on a storage failure
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Draining => "draining",
            SyncState::Error => "error",
        }
    }
}

/// Snapshot of the sync engine for status displays
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub reachable: bool,
    /// Last time an operation was confirmed by the remote
    pub last_sync: Option<DateTime<Utc>>,
    /// Pending and in-flight operations
    pub pending_changes: usize,
    pub failed_changes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// What a single drain did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations handed to the remote
    pub processed: usize,
    pub succeeded: usize,
    /// Rescheduled with backoff
    pub retried: usize,
    /// Parked as failed or dropped as terminal
    pub failed: usize,
    pub conflicts: usize,
    /// Stopped early because the remote became unreachable
    pub paused: bool,
    /// Not run: another drain held the lock, or the remote was unreachable
    pub skipped: bool,
}
