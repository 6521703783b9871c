//! Collaborator interfaces for platform data.
//!
//! The orchestrator never talks to a platform directly. It fetches record
//! sets through a [`RecordSource`] and writes change sets through a
//! [`RecordSink`]; transport and persistence live behind these traits.

use async_trait::async_trait;
use shelf_engine::{ApplyResult, ChangeSet, MergePolicy, PlatformId, RecordSet};

/// Transport failure reported by a platform collaborator.
///
/// The message feeds failure classification, so it should carry the
/// platform's own wording ("connection reset", "permission denied").
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{platform}: {message}")]
pub struct PlatformError {
    pub platform: PlatformId,
    pub message: String,
}

impl PlatformError {
    pub fn new(platform: impl Into<PlatformId>, message: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            message: message.into(),
        }
    }
}

/// Reads a platform's current library.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(&self, platform: &str) -> Result<RecordSet, PlatformError>;
}

/// Writes change sets to a platform.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Apply a change set. Per-record failures are collected in
    /// [`ApplyResult::errors`]; `Err` means nothing could be applied.
    async fn apply_change(
        &self,
        platform: &str,
        changes: &ChangeSet,
        policy: MergePolicy,
    ) -> Result<ApplyResult, PlatformError>;

    /// Undo a change set previously applied by this sink.
    async fn rollback(
        &self,
        platform: &str,
        changes: &ChangeSet,
    ) -> Result<ApplyResult, PlatformError> {
        self.apply_change(platform, &changes.inverse(), MergePolicy::Overwrite)
            .await
    }
}
