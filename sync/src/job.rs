//! Sync jobs, requests and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_engine::{
    ApplyResult, BackoffStrategy, Conflict, DiffSummary, FailureCategory, MergePolicy,
    PlatformId, ResolutionResult, SkippedChange,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal transitions. RUNNING -> RUNNING is a progress update.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        })
    }
}

/// A request to reconcile sources into targets.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub source_platforms: Vec<PlatformId>,
    pub target_platforms: Vec<PlatformId>,
    pub merge_policy: MergePolicy,
    /// Resolve conflicts automatically instead of failing on blocking ones
    pub auto_resolve: bool,
    pub retry_count: u32,
    pub parent_job_id: Option<Uuid>,
    /// Cancelling this token cancels the job
    pub cancel_token: Option<CancellationToken>,
}

impl SyncRequest {
    pub fn new<S, T>(sources: S, targets: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<PlatformId>,
        T: IntoIterator,
        T::Item: Into<PlatformId>,
    {
        Self {
            source_platforms: sources.into_iter().map(Into::into).collect(),
            target_platforms: targets.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Request that resubmits a failed job as a new one.
    pub fn from_failed(job: &SyncJob) -> Self {
        Self {
            source_platforms: job.source_platforms.clone(),
            target_platforms: job.target_platforms.clone(),
            merge_policy: job.merge_policy,
            auto_resolve: job.auto_resolve,
            retry_count: job.retry_count + 1,
            parent_job_id: Some(job.id),
            cancel_token: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.source_platforms.is_empty() {
            return Err(SyncError::Config("at least one source platform is required".into()));
        }
        if self.target_platforms.is_empty() {
            return Err(SyncError::Config("at least one target platform is required".into()));
        }
        Ok(())
    }
}

/// A reconciliation job owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: Uuid,
    pub source_platforms: Vec<PlatformId>,
    pub target_platforms: Vec<PlatformId>,
    pub status: JobStatus,
    /// Percent complete, 0..=100
    pub progress: u8,
    pub submitted_at: DateTime<Utc>,
    /// Set when the job leaves the queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<Uuid>,
    pub merge_policy: MergePolicy,
    pub auto_resolve: bool,
}

impl SyncJob {
    pub(crate) fn new(request: &SyncRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_platforms: request.source_platforms.clone(),
            target_platforms: request.target_platforms.clone(),
            status: JobStatus::Queued,
            progress: 0,
            submitted_at: Utc::now(),
            start_time: None,
            end_time: None,
            retry_count: request.retry_count,
            error: None,
            parent_job_id: request.parent_job_id,
            merge_policy: request.merge_policy,
            auto_resolve: request.auto_resolve,
        }
    }

    /// Move to `next`, stamping the start time on leaving the queue and the
    /// end time on terminal states.
    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if self.status == JobStatus::Queued && next == JobStatus::Running {
            self.start_time = Some(Utc::now());
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// How a detected conflict ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Resolved,
    ManualReviewRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictOutcome {
    pub platform: PlatformId,
    pub conflict: Conflict,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionResult>,
}

/// Per-target outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    pub platform: PlatformId,
    pub summary: DiffSummary,
    pub skipped: Vec<SkippedChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<ApplyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the caller should do about a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    Retry {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
        strategy: BackoffStrategy,
    },
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub category: FailureCategory,
    pub retryable: bool,
    pub next_action: NextAction,
}

/// Kind of resource cleaned up when a job is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// Changes already written to a target platform
    PlatformChanges,
    /// Resolved values that were never applied
    PendingResolutions,
    ConcurrencySlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolledBackResource {
    pub kind: ResourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformId>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub resources: Vec<RolledBackResource>,
}

impl RollbackReport {
    pub fn resource(&self, kind: ResourceKind) -> impl Iterator<Item = &RolledBackResource> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    pub fn is_clean(&self) -> bool {
        self.resources.iter().all(|r| r.errors.is_empty())
    }
}

/// Everything a job produced, beyond its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: Uuid,
    pub source_records: usize,
    /// Captured entries dropped as invalid or duplicate
    pub skipped_records: usize,
    pub targets: Vec<TargetReport>,
    pub conflicts: Vec<ConflictOutcome>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl JobReport {
    pub(crate) fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            source_records: 0,
            skipped_records: 0,
            targets: Vec::new(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            rollback: None,
        }
    }

    pub fn target(&self, platform: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.platform == platform)
    }

    pub fn pending_review(&self) -> impl Iterator<Item = &ConflictOutcome> {
        self.conflicts
            .iter()
            .filter(|c| c.status == ConflictStatus::ManualReviewRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_job_lifecycle() {
        let request = SyncRequest::new(["kindle"], ["kobo"]);
        let mut job = SyncJob::new(&request);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.start_time.is_none());

        job.transition(JobStatus::Running).unwrap();
        let started = job.start_time.unwrap();
        assert!(started >= job.submitted_at);
        assert!(job.end_time.is_none());

        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.start_time, Some(started));
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.end_time.is_some());

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
    }

    #[test]
    fn test_cancelled_in_queue_never_starts() {
        let mut job = SyncJob::new(&SyncRequest::new(["kindle"], ["kobo"]));
        job.transition(JobStatus::Cancelled).unwrap();
        assert!(job.start_time.is_none());
        assert!(job.end_time.is_some());
    }

    #[test]
    fn test_resubmission_request() {
        let request = SyncRequest::new(["kindle"], ["kobo"])
            .with_policy(MergePolicy::Append)
            .with_auto_resolve(true);
        let job = SyncJob::new(&request);

        let retry = SyncRequest::from_failed(&job);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.parent_job_id, Some(job.id));
        assert_eq!(retry.merge_policy, MergePolicy::Append);
        assert!(retry.auto_resolve);
    }

    #[test]
    fn test_request_validation() {
        assert!(SyncRequest::new(["kindle"], ["kobo"]).validate().is_ok());
        assert!(SyncRequest::new(Vec::<String>::new(), ["kobo"]).validate().is_err());
        assert!(SyncRequest::new(["kindle"], Vec::<String>::new()).validate().is_err());
    }

    #[test]
    fn test_next_action_serialization() {
        let action = NextAction::Retry {
            delay_ms: 1000,
            strategy: BackoffStrategy::ExponentialBackoff,
        };
        let json = serde_json::to_value(action).unwrap();
        assert_eq!(json["action"], "RETRY");
        assert_eq!(json["delayMs"], 1000);
        assert_eq!(json["strategy"], "EXPONENTIAL_BACKOFF");
    }
}
