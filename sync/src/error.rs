//! Unified error handling for the sync service.

use crate::platform::PlatformError;
use uuid::Uuid;

/// Sync service error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Engine error: {0}")]
    Engine(#[from] shelf_engine::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Blocking conflicts were found and auto-resolve was not requested.
    #[error("manual intervention required: {} blocking conflict(s)", conflicts.len())]
    ManualInterventionRequired {
        conflicts: Vec<shelf_engine::Conflict>,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} is still active")]
    JobActive(Uuid),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("job {job_id} is not retryable: {reason}")]
    NotRetryable { job_id: Uuid, reason: String },

    #[error("retry cancelled")]
    RetryCancelled,

    #[error("job {job_id} failed: {error}")]
    JobFailed { job_id: Uuid, error: String },

    #[error("apply failed on every target: {0}")]
    ApplyFailed(String),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
