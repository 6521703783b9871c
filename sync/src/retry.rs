//! Retry coordinator.
//!
//! Wraps the engine's [`RetryPolicy`] with timers, jitter sampling and
//! cumulative statistics. A failed job is never resurrected: the executor
//! receives a fresh [`SyncRequest`] and produces a new job.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shelf_engine::{BackoffStrategy, RetryPolicy, RetryableFailure};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::job::{JobStatus, SyncJob, SyncRequest};
use crate::notifier::{EventNotifier, SyncEvent};

/// Cumulative retry counters, safe under concurrent increment.
#[derive(Debug, Default)]
pub struct RetryStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of [`RetryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatsSnapshot {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub cancelled_retries: u64,
    pub success_rate: f64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        RetryStatsSnapshot {
            total_retries: total,
            successful_retries: successful,
            failed_retries: self.failed.load(Ordering::Relaxed),
            cancelled_retries: self.cancelled.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
        }
    }

    pub fn reset(&self) {
        for counter in [&self.total, &self.successful, &self.failed, &self.cancelled] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Decides whether and when failed jobs are resubmitted.
#[derive(Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    stats: Arc<RetryStats>,
    notifier: Option<Arc<dyn EventNotifier>>,
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("policy", &self.policy)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: Arc::new(RetryStats::default()),
            notifier: None,
        }
    }

    /// Publish a `RetryScheduled` event before every backoff wait.
    pub fn with_notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// False once the retry limit is reached or the failure is not
    /// retryable.
    pub fn can_retry(&self, job: &SyncJob) -> bool {
        self.policy.can_retry(job.retry_count, job.error.as_deref())
    }

    pub fn analyze_failure(&self, job: &SyncJob) -> RetryableFailure {
        self.policy.analyze(job.error.as_deref())
    }

    pub fn select_strategy(&self, failure: &RetryableFailure) -> BackoffStrategy {
        self.policy.select_strategy(failure)
    }

    /// Backoff delay with random jitter applied.
    pub fn compute_delay(&self, retry_count: u32, strategy: BackoffStrategy) -> Duration {
        let sample = rand::random::<f64>() * 2.0 - 1.0;
        self.policy.jittered_delay(retry_count, strategy, sample)
    }

    /// Wait out the backoff for `job`, then hand a resubmission request to
    /// `executor`.
    ///
    /// The executor runs at most once. A returned job that did not complete
    /// counts as a failed retry and is reported as [`SyncError::JobFailed`].
    pub async fn execute_retry<F, Fut>(
        &self,
        job: &SyncJob,
        cancel: &CancellationToken,
        executor: F,
    ) -> Result<SyncJob>
    where
        F: FnOnce(SyncRequest) -> Fut,
        Fut: Future<Output = Result<SyncJob>>,
    {
        if job.status != JobStatus::Failed {
            return Err(SyncError::NotRetryable {
                job_id: job.id,
                reason: format!("job is {}", job.status),
            });
        }
        let failure = self.analyze_failure(job);
        if !self.can_retry(job) {
            let reason = if failure.retryable {
                format!("retry limit of {} reached", self.policy.max_retry_attempts)
            } else {
                format!("{} failures are not retryable", failure.category)
            };
            return Err(SyncError::NotRetryable {
                job_id: job.id,
                reason,
            });
        }

        let strategy = self.select_strategy(&failure);
        let delay = self.compute_delay(job.retry_count, strategy);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            job_id = %job.id,
            category = %failure.category,
            strategy = ?strategy,
            delay_ms,
            retry_count = job.retry_count + 1,
            "Scheduling retry"
        );
        if let Some(notifier) = &self.notifier {
            notifier.notify(SyncEvent::RetryScheduled {
                job_id: job.id,
                retry_count: job.retry_count + 1,
                delay_ms,
                strategy,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(job_id = %job.id, "Retry cancelled during backoff");
                return Err(SyncError::RetryCancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match executor(SyncRequest::from_failed(job)).await {
            Ok(retried) if retried.status == JobStatus::Completed => {
                self.stats.successful.fetch_add(1, Ordering::Relaxed);
                tracing::info!(job_id = %job.id, retry_job_id = %retried.id, "Retry succeeded");
                Ok(retried)
            }
            Ok(retried) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let error = retried
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("job ended as {}", retried.status));
                tracing::warn!(job_id = %job.id, retry_job_id = %retried.id, error = %error, "Retry failed");
                Err(SyncError::JobFailed {
                    job_id: retried.id,
                    error,
                })
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job_id = %job.id, error = %e, "Retry failed");
                Err(e)
            }
        }
    }

    /// Run [`RetryCoordinator::execute_retry`] on the runtime.
    pub fn schedule_retry<F, Fut>(&self, job: SyncJob, executor: F) -> RetryHandle
    where
        F: FnOnce(SyncRequest) -> Fut + Send + 'static,
        Fut: Future<Output = Result<SyncJob>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let coordinator = self.clone();
        let cancel = token.clone();
        let task =
            tokio::spawn(async move { coordinator.execute_retry(&job, &cancel, executor).await });
        RetryHandle { token, task }
    }
}

/// A retry running in the background.
#[derive(Debug)]
pub struct RetryHandle {
    token: CancellationToken,
    task: JoinHandle<Result<SyncJob>>,
}

impl RetryHandle {
    /// Abort the backoff wait. Has no effect once the executor started.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the retry outcome.
    pub async fn join(self) -> Result<SyncJob> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Retry task aborted");
                Err(SyncError::RetryCancelled)
            }
        }
    }
}
