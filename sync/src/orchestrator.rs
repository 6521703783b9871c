//! Sync job orchestrator.
//!
//! Owns every [`SyncJob`] and drives it through the pipeline:
//!
//! 1. Fetch source and target libraries (20%)
//! 2. Diff the merged sources against each target (40%)
//! 3. Detect conflicts on modified records (60%)
//! 4. Resolve or flag conflicts (80%)
//! 5. Apply the planned change sets (100%)
//!
//! At most `maxConcurrentSyncs` jobs run at once; the rest wait in a FIFO
//! queue. Cancellation is cooperative: the job's token is checked between
//! checkpoints, between conflicts and between targets, and changes already
//! written are rolled back before the job is marked cancelled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::future::try_join_all;
use shelf_engine::{
    plan_changes, ApplyResult, ChangeSet, Conflict, ConflictDetector, DiffEngine, DiffResult,
    PlatformId, ReconcileConfig, Record, RecordId, RecordSet, ResolutionContext,
    ResolutionEngine, StrategyStats,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::job::{
    ConflictOutcome, ConflictStatus, FailureReport, JobReport, JobStatus, NextAction,
    ResourceKind, RollbackReport, RolledBackResource, SyncJob, SyncRequest, TargetReport,
};
use crate::notifier::{EventNotifier, Stage, SyncEvent, TracingNotifier};
use crate::platform::{RecordSink, RecordSource};
use crate::retry::{RetryCoordinator, RetryHandle};

/// Orchestrator-side state of one job.
struct JobEntry {
    job: SyncJob,
    report: JobReport,
    cancel: CancellationToken,
    status: watch::Sender<JobStatus>,
}

#[derive(Debug, Default)]
struct Scheduler {
    queue: VecDeque<Uuid>,
    /// Concurrency slots in use
    running: usize,
}

/// What a running job has done so far, for rollback.
#[derive(Default)]
struct JobRun {
    applied: Vec<(PlatformId, ChangeSet)>,
    pending_resolutions: usize,
}

struct Inner {
    config: ReconcileConfig,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    notifier: Arc<dyn EventNotifier>,
    diff_engine: DiffEngine,
    detector: ConflictDetector,
    resolver: ResolutionEngine,
    jobs: DashMap<Uuid, JobEntry>,
    scheduler: Mutex<Scheduler>,
    shutdown: CancellationToken,
}

/// Runs sync jobs with bounded concurrency.
///
/// Cheap to clone; clones share the same jobs and queue.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("jobs", &self.inner.jobs.len())
            .field("scheduler", &*self.inner.scheduler())
            .finish()
    }
}

impl SyncOrchestrator {
    /// Create an orchestrator that logs lifecycle events.
    pub fn new(
        config: ReconcileConfig,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self::with_notifier(config, source, sink, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        config: ReconcileConfig,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        let stats = StrategyStats::new_shared();
        let inner = Inner {
            diff_engine: DiffEngine::new(config.diff_options()),
            detector: ConflictDetector::from_config(&config),
            resolver: ResolutionEngine::new(&config, stats),
            config,
            source,
            sink,
            notifier,
            jobs: DashMap::new(),
            scheduler: Mutex::new(Scheduler::default()),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.inner.config
    }

    /// Strategy outcomes shared by every job.
    pub fn strategy_stats(&self) -> &Arc<StrategyStats> {
        self.inner.resolver.stats()
    }

    /// Submit a sync request.
    ///
    /// The job starts immediately when a concurrency slot is free and is
    /// queued otherwise. Must be called from within a Tokio runtime.
    pub fn submit(&self, mut request: SyncRequest) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        request.validate()?;

        let job = SyncJob::new(&request);
        let id = job.id;
        let cancel = match request.cancel_token.take() {
            Some(parent) => parent.child_token(),
            None => self.inner.shutdown.child_token(),
        };
        let (status, _) = watch::channel(JobStatus::Queued);
        self.inner.jobs.insert(
            id,
            JobEntry {
                job,
                report: JobReport::new(id),
                cancel,
                status,
            },
        );

        let position = {
            let mut scheduler = self.inner.scheduler();
            if scheduler.running < self.inner.config.max_concurrent_syncs {
                scheduler.running += 1;
                None
            } else {
                scheduler.queue.push_back(id);
                Some(scheduler.queue.len())
            }
        };

        match position {
            None => {
                tracing::info!(job_id = %id, retry_count = request.retry_count, "Job submitted");
                self.inner.spawn(id);
            }
            Some(position) => {
                tracing::info!(job_id = %id, position, "Job queued");
                self.inner
                    .notifier
                    .notify(SyncEvent::JobQueued { job_id: id, position });
            }
        }
        Ok(id)
    }

    /// Request cancellation.
    ///
    /// Queued jobs are cancelled at once. Running jobs stop at their next
    /// checkpoint and roll back what they applied.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let dequeued = {
            let mut scheduler = self.inner.scheduler();
            match scheduler.queue.iter().position(|queued| *queued == id) {
                Some(index) => scheduler.queue.remove(index).is_some(),
                None => false,
            }
        };
        if dequeued {
            self.inner.mark_cancelled(id, RollbackReport::default());
            return Ok(());
        }

        let entry = self
            .inner
            .jobs
            .get(&id)
            .ok_or(SyncError::JobNotFound(id))?;
        if entry.job.is_terminal() {
            return Err(SyncError::InvalidTransition {
                from: entry.job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }
        entry.cancel.cancel();
        tracing::info!(job_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, id: Uuid) -> Result<SyncJob> {
        let mut status = self
            .inner
            .jobs
            .get(&id)
            .map(|entry| entry.status.subscribe())
            .ok_or(SyncError::JobNotFound(id))?;

        status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| SyncError::JobNotFound(id))?;
        self.job(id)
    }

    pub fn job(&self, id: Uuid) -> Result<SyncJob> {
        self.inner
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(SyncError::JobNotFound(id))
    }

    pub fn report(&self, id: Uuid) -> Result<JobReport> {
        self.inner
            .jobs
            .get(&id)
            .map(|entry| entry.report.clone())
            .ok_or(SyncError::JobNotFound(id))
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.submitted_at);
        jobs
    }

    /// Drop a finished job and return its final report.
    pub fn forget(&self, id: Uuid) -> Result<(SyncJob, JobReport)> {
        match self.inner.jobs.remove_if(&id, |_, entry| entry.job.is_terminal()) {
            Some((_, entry)) => {
                tracing::debug!(job_id = %id, status = %entry.job.status, "Job forgotten");
                Ok((entry.job, entry.report))
            }
            None if self.inner.jobs.contains_key(&id) => Err(SyncError::JobActive(id)),
            None => Err(SyncError::JobNotFound(id)),
        }
    }

    /// Drop every finished job. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let mut removed = 0;
        self.inner.jobs.retain(|_, entry| {
            let keep = !entry.job.is_terminal();
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(removed, "Pruned finished jobs");
        }
        removed
    }

    /// Concurrency slots in use.
    pub fn running_count(&self) -> usize {
        self.inner.scheduler().running
    }

    pub fn queued_count(&self) -> usize {
        self.inner.scheduler().queue.len()
    }

    /// Refuse new jobs, cancel everything in flight and wait for it to
    /// settle.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let queued: Vec<Uuid> = self.inner.scheduler().queue.drain(..).collect();
        for id in queued {
            self.inner.mark_cancelled(id, RollbackReport::default());
        }

        let active: Vec<Uuid> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| !entry.job.is_terminal())
            .map(|entry| {
                entry.cancel.cancel();
                *entry.key()
            })
            .collect();
        tracing::info!(active = active.len(), "Shutting down orchestrator");

        for id in active {
            if let Err(e) = self.wait(id).await {
                tracing::warn!(job_id = %id, error = %e, "Job did not settle during shutdown");
            }
        }
    }

    /// Resubmit a failed job through `coordinator` and wait for the new job.
    pub async fn retry_job(&self, id: Uuid, coordinator: &RetryCoordinator) -> Result<SyncJob> {
        let job = self.job(id)?;
        let cancel = self.inner.shutdown.child_token();
        coordinator
            .execute_retry(&job, &cancel, move |request| async move {
                let retry_id = self.submit(request)?;
                self.wait(retry_id).await
            })
            .await
    }

    /// Like [`SyncOrchestrator::retry_job`], but in the background.
    pub fn spawn_retry(&self, id: Uuid, coordinator: &RetryCoordinator) -> Result<RetryHandle> {
        let job = self.job(id)?;
        let orchestrator = self.clone();
        Ok(coordinator.schedule_retry(job, move |request| async move {
            let retry_id = orchestrator.submit(request)?;
            orchestrator.wait(retry_id).await
        }))
    }
}

fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

impl Inner {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(self: &Arc<Self>, id: Uuid) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run(id).await;
            inner.release_slot();
        });
    }

    /// Hand the finished job's slot to the next queued job, if any.
    fn release_slot(self: &Arc<Self>) {
        let next = {
            let mut scheduler = self.scheduler();
            let next = scheduler.queue.pop_front();
            if next.is_none() {
                scheduler.running = scheduler.running.saturating_sub(1);
            }
            next
        };
        if let Some(id) = next {
            tracing::debug!(job_id = %id, "Dequeued job");
            self.spawn(id);
        }
    }

    fn with_entry<R>(&self, id: Uuid, f: impl FnOnce(&mut JobEntry) -> R) -> Option<R> {
        self.jobs.get_mut(&id).map(|mut entry| f(&mut entry))
    }

    fn update_report(&self, id: Uuid, f: impl FnOnce(&mut JobReport)) {
        self.with_entry(id, |entry| f(&mut entry.report));
    }

    async fn run(&self, id: Uuid) {
        let Some((job, token)) = self.start(id) else {
            return;
        };

        let mut run = JobRun::default();
        match self.execute(&job, &token, &mut run).await {
            Ok(()) => self.mark_completed(id),
            Err(SyncError::Cancelled) => {
                let rollback = self.rollback(id, &run).await;
                self.mark_cancelled(id, rollback);
            }
            Err(e) => self.mark_failed(id, e),
        }
    }

    /// QUEUED -> RUNNING. Returns `None` when the job was cancelled while
    /// waiting.
    fn start(&self, id: Uuid) -> Option<(SyncJob, CancellationToken)> {
        let started = self.with_entry(id, |entry| {
            if entry.job.status != JobStatus::Queued {
                return None;
            }
            entry.job.transition(JobStatus::Running).ok()?;
            entry.status.send_replace(JobStatus::Running);
            Some((entry.job.clone(), entry.cancel.clone()))
        })??;

        tracing::info!(job_id = %id, sources = ?started.0.source_platforms, targets = ?started.0.target_platforms, "Job started");
        self.notifier.notify(SyncEvent::JobStarted { job_id: id });
        Some(started)
    }

    fn checkpoint(&self, id: Uuid, stage: Stage, token: &CancellationToken) -> Result<()> {
        ensure_active(token)?;
        self.with_entry(id, |entry| {
            entry.job.transition(JobStatus::Running)?;
            entry.job.progress = stage.progress();
            Ok::<_, SyncError>(())
        })
        .ok_or(SyncError::JobNotFound(id))??;

        tracing::debug!(job_id = %id, stage = %stage, progress = stage.progress(), "Checkpoint reached");
        self.notifier.notify(SyncEvent::JobProgress {
            job_id: id,
            stage,
            progress: stage.progress(),
        });
        Ok(())
    }

    async fn execute(
        &self,
        job: &SyncJob,
        token: &CancellationToken,
        run: &mut JobRun,
    ) -> Result<()> {
        let id = job.id;
        ensure_active(token)?;

        // Fetch
        let sources = try_join_all(
            job.source_platforms
                .iter()
                .map(|p| self.source.fetch_records(p)),
        )
        .await?;
        let targets = try_join_all(
            job.target_platforms
                .iter()
                .map(|p| self.source.fetch_records(p)),
        )
        .await?;

        let mut source = RecordSet::default();
        for set in sources {
            source.merge(set);
        }
        let fetched = source.len();
        let rejected = source.rejected() + targets.iter().map(RecordSet::rejected).sum::<usize>();
        self.update_report(id, |report| {
            report.source_records = fetched;
            report.skipped_records = rejected;
        });
        self.checkpoint(id, Stage::Fetch, token)?;

        // Diff
        let diffs: Vec<(PlatformId, DiffResult)> = job
            .target_platforms
            .iter()
            .zip(&targets)
            .map(|(platform, target)| (platform.clone(), self.diff_engine.diff(&source, target)))
            .collect();
        self.update_report(id, |report| {
            report.skipped_records += diffs.iter().map(|(_, d)| d.skipped).sum::<usize>();
            for (platform, diff) in diffs.iter().filter(|(_, d)| !d.quarantined.is_empty()) {
                report.warnings.push(format!(
                    "{platform}: invalid entries left untouched: {}",
                    diff.quarantined.join(", ")
                ));
            }
            report.targets = diffs
                .iter()
                .map(|(platform, diff)| TargetReport {
                    platform: platform.clone(),
                    summary: diff.summary(),
                    ..Default::default()
                })
                .collect();
        });
        self.checkpoint(id, Stage::Diff, token)?;

        // Detect
        let mut conflicts: Vec<(usize, Conflict)> = Vec::new();
        for (index, (_, diff)) in diffs.iter().enumerate() {
            for conflict in self.detector.detect_all(diff) {
                self.notifier.notify(SyncEvent::ConflictDetected {
                    job_id: id,
                    conflict_id: conflict.id.clone(),
                    item_id: conflict.item_id.clone(),
                    severity: conflict.severity,
                });
                conflicts.push((index, conflict));
            }
        }
        tracing::debug!(job_id = %id, conflicts = conflicts.len(), "Conflicts detected");
        self.checkpoint(id, Stage::Detect, token)?;

        // Resolve
        if !job.auto_resolve {
            let blocking: Vec<Conflict> = conflicts
                .iter()
                .filter(|(_, c)| c.severity.is_blocking())
                .map(|(_, c)| c.clone())
                .collect();
            if !blocking.is_empty() {
                let outcomes = conflicts
                    .iter()
                    .map(|(index, conflict)| ConflictOutcome {
                        platform: diffs[*index].0.clone(),
                        conflict: conflict.clone(),
                        status: ConflictStatus::ManualReviewRequired,
                        resolution: None,
                    })
                    .collect();
                self.update_report(id, |report| report.conflicts = outcomes);
                return Err(SyncError::ManualInterventionRequired {
                    conflicts: blocking,
                });
            }
        }

        let mut overrides: Vec<HashMap<RecordId, Record>> = vec![HashMap::new(); diffs.len()];
        let mut withheld: Vec<HashSet<RecordId>> = vec![HashSet::new(); diffs.len()];
        let mut outcomes = Vec::with_capacity(conflicts.len());
        let mut warnings = Vec::new();

        for (index, conflict) in conflicts {
            ensure_active(token)?;
            let (platform, diff) = &diffs[index];

            let resolution = job.auto_resolve.then(|| {
                let context = ResolutionContext::new(job.source_platforms[0].clone(), platform.clone());
                self.resolver.auto_resolve(&conflict, &context)
            });

            let patched = match &resolution {
                Some(result) if result.success => {
                    let value = result.resolved_value.clone().unwrap_or_default();
                    let base = overrides[index].get(&conflict.item_id).cloned().or_else(|| {
                        diff.modified
                            .iter()
                            .find(|entry| entry.id == conflict.item_id)
                            .map(|entry| entry.source.clone())
                    });
                    match base.map(|record| record.set_field(&conflict.field, value)) {
                        Some(Ok(record)) => Some(record),
                        Some(Err(e)) => {
                            warnings.push(format!(
                                "{platform}: resolved value for {} not applicable: {e}",
                                conflict.id
                            ));
                            None
                        }
                        None => None,
                    }
                }
                _ => None,
            };

            let status = match patched {
                Some(record) => {
                    if let Some(strategy) = resolution.as_ref().and_then(|r| r.strategy) {
                        self.notifier.notify(SyncEvent::ConflictResolved {
                            job_id: id,
                            conflict_id: conflict.id.clone(),
                            strategy,
                        });
                    }
                    overrides[index].insert(conflict.item_id.clone(), record);
                    ConflictStatus::Resolved
                }
                None => {
                    withheld[index].insert(conflict.item_id.clone());
                    ConflictStatus::ManualReviewRequired
                }
            };

            outcomes.push(ConflictOutcome {
                platform: platform.clone(),
                conflict,
                status,
                resolution,
            });
        }

        run.pending_resolutions = overrides.iter().map(HashMap::len).sum();
        self.update_report(id, |report| {
            report.conflicts = outcomes;
            report.warnings.append(&mut warnings);
        });
        self.checkpoint(id, Stage::Resolve, token)?;

        // Apply
        let mut failures = Vec::new();
        for (index, (platform, diff)) in diffs.iter().enumerate() {
            ensure_active(token)?;
            let plan = plan_changes(diff, &overrides[index], &withheld[index], job.merge_policy);
            let warnings: Vec<String> = plan
                .warnings
                .iter()
                .map(|w| format!("{platform}: {w}"))
                .collect();
            for warning in &warnings {
                tracing::warn!(job_id = %id, platform = %platform, "{}", warning);
            }

            let applied = if plan.change_set.is_empty() {
                Ok(ApplyResult::default())
            } else {
                self.sink
                    .apply_change(platform, &plan.change_set, job.merge_policy)
                    .await
            };

            let (applied, error) = match applied {
                Ok(result) => {
                    run.pending_resolutions =
                        run.pending_resolutions.saturating_sub(overrides[index].len());
                    run.applied.push((platform.clone(), plan.change_set));
                    (Some(result), None)
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, platform = %platform, error = %e, "Apply failed");
                    failures.push(e.to_string());
                    (None, Some(e.to_string()))
                }
            };

            self.update_report(id, |report| {
                report.warnings.extend(warnings);
                if let Some(target) = report.targets.get_mut(index) {
                    target.skipped = plan.skipped;
                    target.applied = applied;
                    target.error = error;
                }
            });
        }

        if !diffs.is_empty() && failures.len() == diffs.len() {
            return Err(SyncError::ApplyFailed(failures.join("; ")));
        }
        self.checkpoint(id, Stage::Apply, token)?;
        Ok(())
    }

    /// Undo applied change sets, newest first.
    async fn rollback(&self, id: Uuid, run: &JobRun) -> RollbackReport {
        let mut report = RollbackReport::default();

        for (platform, changes) in run.applied.iter().rev() {
            if changes.is_empty() {
                continue;
            }
            let resource = match self.sink.rollback(platform, changes).await {
                Ok(result) => RolledBackResource {
                    kind: ResourceKind::PlatformChanges,
                    platform: Some(platform.clone()),
                    count: result.applied(),
                    errors: result.errors,
                },
                Err(e) => RolledBackResource {
                    kind: ResourceKind::PlatformChanges,
                    platform: Some(platform.clone()),
                    count: 0,
                    errors: vec![e.to_string()],
                },
            };
            tracing::info!(
                job_id = %id,
                platform = %platform,
                reverted = resource.count,
                errors = resource.errors.len(),
                "Rolled back platform changes"
            );
            report.resources.push(resource);
        }

        if run.pending_resolutions > 0 {
            report.resources.push(RolledBackResource {
                kind: ResourceKind::PendingResolutions,
                platform: None,
                count: run.pending_resolutions,
                errors: Vec::new(),
            });
        }
        report.resources.push(RolledBackResource {
            kind: ResourceKind::ConcurrencySlot,
            platform: None,
            count: 1,
            errors: Vec::new(),
        });
        report
    }

    fn finish(&self, id: Uuid, status: JobStatus, f: impl FnOnce(&mut JobEntry)) -> bool {
        self.with_entry(id, |entry| match entry.job.transition(status) {
            Ok(()) => {
                f(entry);
                entry.status.send_replace(status);
                true
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Cannot finish job");
                false
            }
        })
        .unwrap_or(false)
    }

    fn mark_completed(&self, id: Uuid) {
        if self.finish(id, JobStatus::Completed, |_| {}) {
            tracing::info!(job_id = %id, "Job completed");
            self.notifier.notify(SyncEvent::JobCompleted { job_id: id });
        }
    }

    fn mark_failed(&self, id: Uuid, error: SyncError) {
        let message = error.to_string();
        let policy = self.config.retry_policy();

        let finished = self.finish(id, JobStatus::Failed, |entry| {
            let failure = policy.analyze(Some(&message));
            let next_action = if policy.can_retry(entry.job.retry_count, Some(&message)) {
                let strategy = policy.select_strategy(&failure);
                let delay = policy.base_delay(entry.job.retry_count, strategy);
                NextAction::Retry {
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    strategy,
                }
            } else {
                NextAction::Escalate
            };
            entry.job.error = Some(message.clone());
            entry.report.failure = Some(FailureReport {
                category: failure.category,
                retryable: failure.retryable,
                next_action,
            });
        });

        if finished {
            tracing::warn!(job_id = %id, error = %message, "Job failed");
            self.notifier.notify(SyncEvent::JobFailed {
                job_id: id,
                error: message,
            });
        }
    }

    fn mark_cancelled(&self, id: Uuid, rollback: RollbackReport) {
        let finished = self.finish(id, JobStatus::Cancelled, |entry| {
            entry.job.error = Some(SyncError::Cancelled.to_string());
            entry.report.rollback = Some(rollback);
        });
        if finished {
            tracing::info!(job_id = %id, "Job cancelled");
            self.notifier.notify(SyncEvent::JobCancelled { job_id: id });
        }
    }
}
