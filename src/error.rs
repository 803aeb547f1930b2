//! Error types for the listsync core

use thiserror::Error;

use crate::remote::RemoteRecord;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached at all (connect failure, DNS, no route)
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// The target resource no longer exists on the remote
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller's base version is stale
    #[error("Version conflict (remote version {})", remote_version(.current))]
    VersionConflict { current: Option<Box<RemoteRecord>> },

    /// 5xx from the remote
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The remote did not answer within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// The connection broke while a request or response was in transit
    #[error("Connection interrupted: {0}")]
    Interrupted(String),

    /// Non-retryable client error (4xx other than 404/409)
    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A persisted queue entry could not be decoded
    #[error("Corrupt queue entry {id}: {reason}")]
    QueueCorruption { id: String, reason: String },

    /// A mutation targeted a resource with a pending delete
    #[error("Resource has a pending delete: {0}")]
    ResourceDeleted(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn remote_version(current: &Option<Box<RemoteRecord>>) -> String {
    current
        .as_ref()
        .map(|r| r.version.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl SyncError {
    /// Whether the failure should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Server { .. } | SyncError::Timeout | SyncError::Interrupted(_)
        )
    }

    /// Whether the failure originates in the transport rather than the remote's answer
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable(_) | SyncError::Timeout | SyncError::Interrupted(_)
        )
    }
}

/// Classify an HTTP status into the error taxonomy.
///
/// 404 and 409 are handled by the caller since they carry bodies.
pub fn classify_http_status(status: u16, message: String) -> SyncError {
    match status {
        404 => SyncError::NotFound(message),
        409 => SyncError::VersionConflict { current: None },
        500..=599 => SyncError::Server { status, message },
        _ => SyncError::Rejected { status, message },
    }
}
