//! Integration tests for sync job orchestration.
//!
//! Jobs run against an in-memory platform; timing-sensitive tests use
//! paused Tokio time.

use std::sync::Arc;
use std::time::Duration;

use shelf_engine::{
    BackoffStrategy, FailureCategory, MergePolicy, ReconcileConfig, Record, RecordSet,
    StrategyKind,
};
use shelf_sync::{
    ConflictStatus, InMemoryPlatform, JobStatus, NextAction, NotificationHub, ResourceKind,
    RetryCoordinator, SyncError, SyncEvent, SyncOrchestrator, SyncRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn book(id: &str, title: &str, progress: f64) -> Record {
    Record::new(id, title).with_progress(progress)
}

fn orchestrator(platform: &Arc<InMemoryPlatform>) -> SyncOrchestrator {
    orchestrator_with(platform, ReconcileConfig::default())
}

fn orchestrator_with(platform: &Arc<InMemoryPlatform>, config: ReconcileConfig) -> SyncOrchestrator {
    SyncOrchestrator::new(config, platform.clone(), platform.clone())
}

fn drain(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kindle_to_kobo() -> SyncRequest {
    SyncRequest::new(["kindle"], ["kobo"])
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_auto_resolve_applies_higher_progress() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library(
        "kindle",
        vec![book("b1", "Foo", 40.0), Record::new("b4", "New Arrival")],
    );
    platform.insert_library(
        "kobo",
        vec![book("b1", "Foo", 70.0), Record::new("b5", "Stale")],
    );
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(kindle_to_kobo().with_auto_resolve(true))
        .unwrap();
    let job = orchestrator.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.end_time.is_some());

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.source_records, 2);
    assert_eq!(report.conflicts.len(), 1);
    let outcome = &report.conflicts[0];
    assert_eq!(outcome.status, ConflictStatus::Resolved);
    assert_eq!(
        outcome.resolution.as_ref().and_then(|r| r.strategy),
        Some(StrategyKind::UseHigherProgress)
    );

    let target = report.target("kobo").unwrap();
    assert_eq!(target.summary.added, 1);
    assert_eq!(target.summary.modified, 1);
    assert_eq!(target.summary.deleted, 1);

    assert_eq!(platform.record("kobo", "b1").unwrap().progress, Some(70.0));
    assert!(platform.record("kobo", "b4").is_some());
    assert!(platform.record("kobo", "b5").is_none());
    assert_eq!(
        orchestrator
            .strategy_stats()
            .outcome(StrategyKind::UseHigherProgress)
            .successes,
        1
    );
}

#[tokio::test]
async fn test_blocking_conflict_requires_manual_intervention() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![book("b2", "Completely Different", 10.0)]);
    platform.insert_library("kobo", vec![book("b2", "Original Name", 10.0)]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    let job = orchestrator.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 60);
    assert!(job
        .error
        .as_deref()
        .unwrap()
        .contains("manual intervention required"));

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.pending_review().count(), 1);
    let failure = report.failure.unwrap();
    assert_eq!(failure.category, FailureCategory::DataConflict);
    assert_eq!(
        failure.next_action,
        NextAction::Retry {
            delay_ms: 500,
            strategy: BackoffStrategy::ConflictResolutionFirst,
        }
    );

    assert_eq!(platform.apply_count(), 0);
    assert_eq!(platform.record("kobo", "b2").unwrap().title, "Original Name");
}

#[tokio::test]
async fn test_auto_resolve_withholds_manual_review_records() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library(
        "kindle",
        vec![
            book("b2", "Completely Different", 10.0),
            Record::new("b4", "New Arrival"),
        ],
    );
    platform.insert_library("kobo", vec![book("b2", "Original Name", 10.0)]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(kindle_to_kobo().with_auto_resolve(true))
        .unwrap();
    let job = orchestrator.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.pending_review().count(), 1);
    let target = report.target("kobo").unwrap();
    assert_eq!(target.skipped.len(), 1);
    assert_eq!(target.skipped[0].record_id, "b2");
    assert_eq!(target.applied.as_ref().unwrap().added, 1);

    assert_eq!(platform.record("kobo", "b2").unwrap().title, "Original Name");
    assert!(platform.record("kobo", "b4").is_some());
}

#[tokio::test]
async fn test_overwrite_forces_manual_review_records() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library(
        "kindle",
        vec![
            book("b2", "Completely Different", 10.0),
            Record::new("b4", "New Arrival"),
        ],
    );
    platform.insert_library("kobo", vec![book("b2", "Original Name", 10.0)]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(
            kindle_to_kobo()
                .with_auto_resolve(true)
                .with_policy(MergePolicy::Overwrite),
        )
        .unwrap();
    assert_eq!(
        orchestrator.wait(id).await.unwrap().status,
        JobStatus::Completed
    );

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.pending_review().count(), 1);
    let target = report.target("kobo").unwrap();
    assert!(target.skipped.is_empty());
    let applied = target.applied.as_ref().unwrap();
    assert_eq!(applied.added, 1);
    assert_eq!(applied.modified, 1);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("kobo: OVERWRITE") && w.contains("will be lost")));

    assert_eq!(
        platform.record("kobo", "b2").unwrap().title,
        "Completely Different"
    );
    assert!(platform.record("kobo", "b4").is_some());
}

#[tokio::test]
async fn test_invalid_source_entry_leaves_target_untouched() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![book("b1", "Foo", 100.5)]);
    platform.insert_library("kobo", vec![book("b1", "Foo", 90.0)]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert_eq!(
        orchestrator.wait(id).await.unwrap().status,
        JobStatus::Completed
    );

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.skipped_records, 2);
    assert_eq!(report.target("kobo").unwrap().summary.deleted, 0);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("kobo: invalid entries") && w.ends_with("b1")));

    assert_eq!(platform.record("kobo", "b1").unwrap().progress, Some(90.0));
    assert_eq!(platform.apply_count(), 0);
}

#[tokio::test]
async fn test_unreadable_capture_entry_leaves_target_untouched() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_capture(
        "kindle",
        RecordSet::from_json_values(vec![
            serde_json::json!({"id": "b1", "title": "Foo", "lastUpdated": "2024-05-01T10:00:00Z"}),
            serde_json::json!({"id": "b4", "title": "New Arrival"}),
        ]),
    );
    platform.insert_library("kobo", vec![book("b1", "Foo", 90.0)]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert_eq!(
        orchestrator.wait(id).await.unwrap().status,
        JobStatus::Completed
    );

    let report = orchestrator.report(id).unwrap();
    assert_eq!(report.source_records, 1);
    assert_eq!(report.skipped_records, 2);
    let summary = &report.target("kobo").unwrap().summary;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.deleted, 0);

    assert_eq!(platform.record("kobo", "b1").unwrap().progress, Some(90.0));
    assert!(platform.record("kobo", "b4").is_some());
}

#[tokio::test]
async fn test_append_policy_only_adds() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library(
        "kindle",
        vec![book("b1", "Foo", 45.0), Record::new("b4", "New Arrival")],
    );
    platform.insert_library(
        "kobo",
        vec![book("b1", "Foo", 40.0), Record::new("b5", "Stale")],
    );
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(kindle_to_kobo().with_policy(MergePolicy::Append))
        .unwrap();
    assert_eq!(
        orchestrator.wait(id).await.unwrap().status,
        JobStatus::Completed
    );

    assert_eq!(platform.records("kobo").len(), 3);
    assert_eq!(platform.record("kobo", "b1").unwrap().progress, Some(40.0));
    assert!(platform.record("kobo", "b5").is_some());
    assert_eq!(
        orchestrator.report(id).unwrap().target("kobo").unwrap().skipped.len(),
        2
    );
}

#[tokio::test]
async fn test_lifecycle_events() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![book("b1", "Foo", 40.0)]);
    platform.insert_library("kobo", vec![book("b1", "Foo", 70.0)]);
    let hub = NotificationHub::new_shared();
    let (_subscriber, mut rx) = hub.subscribe();
    let orchestrator = SyncOrchestrator::with_notifier(
        ReconcileConfig::default(),
        platform.clone(),
        platform.clone(),
        hub.clone(),
    );

    let id = orchestrator
        .submit(kindle_to_kobo().with_auto_resolve(true))
        .unwrap();
    orchestrator.wait(id).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&SyncEvent::JobStarted { job_id: id }));
    assert_eq!(events.last(), Some(&SyncEvent::JobCompleted { job_id: id }));
    assert!(events.iter().all(|e| e.job_id() == id));

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::JobProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![20, 40, 60, 80, 100]);

    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ConflictResolved {
            strategy: StrategyKind::UseHigherProgress,
            ..
        }
    )));
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let platform = Arc::new(InMemoryPlatform::new());
    let orchestrator = orchestrator(&platform);

    let err = orchestrator
        .submit(SyncRequest::new(Vec::<String>::new(), ["kobo"]))
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert!(orchestrator.jobs().is_empty());
}

// ============================================================================
// Failures and Retry
// ============================================================================

#[tokio::test]
async fn test_partial_apply_failure_completes() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![Record::new("b4", "New Arrival")]);
    platform.fail_applies("kobo", "server error 500");
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(SyncRequest::new(["kindle"], ["kobo", "nook"]))
        .unwrap();
    assert_eq!(
        orchestrator.wait(id).await.unwrap().status,
        JobStatus::Completed
    );

    let report = orchestrator.report(id).unwrap();
    assert!(report
        .target("kobo")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("server error 500"));
    assert!(report.target("nook").unwrap().error.is_none());
    assert!(platform.record("nook", "b4").is_some());
}

#[tokio::test]
async fn test_apply_failure_on_every_target_fails_job() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![Record::new("b4", "New Arrival")]);
    platform.fail_applies("kobo", "server error 500");
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert_eq!(orchestrator.wait(id).await.unwrap().status, JobStatus::Failed);

    let failure = orchestrator.report(id).unwrap().failure.unwrap();
    assert_eq!(failure.category, FailureCategory::ServerError);
    assert_eq!(
        failure.next_action,
        NextAction::Retry {
            delay_ms: 1_000,
            strategy: BackoffStrategy::LinearBackoff,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_is_retried() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_library("kindle", vec![book("b1", "Foo", 40.0)]);
    platform.insert_library("kobo", vec![book("b1", "Foo", 30.0)]);
    platform.fail_next_fetch("kobo", "network timeout");
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    let failed = orchestrator.wait(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.progress, 0);

    let failure = orchestrator.report(id).unwrap().failure.unwrap();
    assert_eq!(failure.category, FailureCategory::Network);
    assert!(failure.retryable);
    assert_eq!(
        failure.next_action,
        NextAction::Retry {
            delay_ms: 1_000,
            strategy: BackoffStrategy::ExponentialBackoff,
        }
    );

    let coordinator = RetryCoordinator::new(orchestrator.config().retry_policy());
    let retried = orchestrator.retry_job(id, &coordinator).await.unwrap();
    assert_eq!(retried.status, JobStatus::Completed);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.parent_job_id, Some(id));
    assert_ne!(retried.id, id);

    assert_eq!(coordinator.stats().successful_retries, 1);
    assert_eq!(platform.record("kobo", "b1").unwrap().progress, Some(40.0));
    assert_eq!(orchestrator.jobs().len(), 2);
}

#[tokio::test]
async fn test_permission_denied_escalates() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.fail_next_fetch("kindle", "permission denied");
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert_eq!(orchestrator.wait(id).await.unwrap().status, JobStatus::Failed);

    let failure = orchestrator.report(id).unwrap().failure.unwrap();
    assert_eq!(failure.category, FailureCategory::Authorization);
    assert!(!failure.retryable);
    assert_eq!(failure.next_action, NextAction::Escalate);

    let coordinator = RetryCoordinator::new(orchestrator.config().retry_policy());
    let err = orchestrator.retry_job(id, &coordinator).await.unwrap_err();
    assert!(matches!(err, SyncError::NotRetryable { .. }));
    assert_eq!(coordinator.stats().total_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_retry_can_be_cancelled() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.fail_next_fetch("kobo", "connection reset");
    let orchestrator = orchestrator(&platform);

    let id = orchestrator.submit(kindle_to_kobo()).unwrap();
    orchestrator.wait(id).await.unwrap();

    let coordinator = RetryCoordinator::new(orchestrator.config().retry_policy());
    let handle = orchestrator.spawn_retry(id, &coordinator).unwrap();
    handle.cancel();
    assert!(matches!(
        handle.join().await,
        Err(SyncError::RetryCancelled)
    ));
    assert_eq!(coordinator.stats().cancelled_retries, 1);
    assert_eq!(orchestrator.jobs().len(), 1);
}

// ============================================================================
// Scheduling and Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_queues_fifo() {
    let platform =
        Arc::new(InMemoryPlatform::new().with_fetch_delay(Duration::from_millis(100)));
    platform.insert_library("kindle", vec![Record::new("b4", "New Arrival")]);
    let hub = NotificationHub::new_shared();
    let (_subscriber, mut rx) = hub.subscribe();
    let orchestrator = SyncOrchestrator::with_notifier(
        ReconcileConfig::default(),
        platform.clone(),
        platform.clone(),
        hub.clone(),
    );

    let ids: Vec<_> = (0..5)
        .map(|_| orchestrator.submit(kindle_to_kobo()).unwrap())
        .collect();
    assert_eq!(orchestrator.running_count(), 3);
    assert_eq!(orchestrator.queued_count(), 2);

    for id in &ids {
        let job = orchestrator.wait(*id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    let events = drain(&mut rx);
    let queued: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::JobQueued { job_id, position } => Some((*job_id, *position)),
            _ => None,
        })
        .collect();
    assert_eq!(queued, vec![(ids[3], 1), (ids[4], 2)]);

    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::JobStarted { job_id } => Some(*job_id),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 5);
    assert_eq!(&started[3..], &[ids[3], ids[4]]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_job() {
    let platform =
        Arc::new(InMemoryPlatform::new().with_fetch_delay(Duration::from_millis(100)));
    let config = ReconcileConfig {
        max_concurrent_syncs: 1,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(&platform, config);

    let first = orchestrator.submit(kindle_to_kobo()).unwrap();
    let second = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert_eq!(orchestrator.queued_count(), 1);

    orchestrator.cancel(second).unwrap();
    assert_eq!(orchestrator.queued_count(), 0);
    assert_eq!(orchestrator.job(second).unwrap().status, JobStatus::Cancelled);
    assert!(orchestrator.report(second).unwrap().rollback.is_some());

    let err = orchestrator.cancel(second).unwrap_err();
    assert!(matches!(err, SyncError::InvalidTransition { .. }));

    assert_eq!(
        orchestrator.wait(first).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_queued_job_starts_when_dequeued() {
    let platform =
        Arc::new(InMemoryPlatform::new().with_fetch_delay(Duration::from_millis(100)));
    let config = ReconcileConfig {
        max_concurrent_syncs: 1,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(&platform, config);

    let first = orchestrator.submit(kindle_to_kobo()).unwrap();
    let second = orchestrator.submit(kindle_to_kobo()).unwrap();
    assert!(orchestrator.job(second).unwrap().start_time.is_none());

    let first = orchestrator.wait(first).await.unwrap();
    let second = orchestrator.wait(second).await.unwrap();
    let started = second.start_time.unwrap();
    assert!(started >= second.submitted_at);
    assert!(started >= first.end_time.unwrap());
    assert_eq!(
        orchestrator.jobs().iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_can_be_forgotten() {
    let platform =
        Arc::new(InMemoryPlatform::new().with_fetch_delay(Duration::from_millis(100)));
    platform.insert_library("kindle", vec![Record::new("b4", "New Arrival")]);
    let orchestrator = orchestrator(&platform);

    let done = orchestrator.submit(kindle_to_kobo()).unwrap();
    orchestrator.wait(done).await.unwrap();
    let active = orchestrator.submit(kindle_to_kobo()).unwrap();

    assert!(matches!(
        orchestrator.forget(active),
        Err(SyncError::JobActive(id)) if id == active
    ));
    let (job, report) = orchestrator.forget(done).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(report.target("kobo").unwrap().summary.added, 1);
    assert!(matches!(
        orchestrator.job(done),
        Err(SyncError::JobNotFound(_))
    ));
    assert!(matches!(
        orchestrator.forget(done),
        Err(SyncError::JobNotFound(_))
    ));

    assert_eq!(orchestrator.prune_finished(), 0);
    orchestrator.wait(active).await.unwrap();
    assert_eq!(orchestrator.prune_finished(), 1);
    assert!(orchestrator.jobs().is_empty());
}

#[tokio::test]
async fn test_cancellation_rolls_back_applied_targets() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let platform = Arc::new(InMemoryPlatform::new().on_apply(move |platform| {
        if platform == "kobo" {
            trigger.cancel();
        }
    }));
    platform.insert_library("kindle", vec![Record::new("b4", "New Arrival")]);
    let orchestrator = orchestrator(&platform);

    let id = orchestrator
        .submit(SyncRequest::new(["kindle"], ["kobo", "nook"]).with_cancel_token(token))
        .unwrap();
    let job = orchestrator.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    let report = orchestrator.report(id).unwrap();
    let rollback = report.rollback.as_ref().unwrap();
    assert!(rollback.is_clean());
    let reverted: Vec<_> = rollback.resource(ResourceKind::PlatformChanges).collect();
    assert_eq!(reverted.len(), 1);
    assert_eq!(reverted[0].platform.as_deref(), Some("kobo"));
    assert_eq!(reverted[0].count, 1);
    assert_eq!(rollback.resource(ResourceKind::ConcurrencySlot).count(), 1);

    assert!(platform.records("kobo").is_empty());
    assert!(platform.records("nook").is_empty());
    assert!(report.target("nook").unwrap().applied.is_none());
    assert_eq!(platform.apply_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_everything() {
    let platform =
        Arc::new(InMemoryPlatform::new().with_fetch_delay(Duration::from_millis(100)));
    let config = ReconcileConfig {
        max_concurrent_syncs: 1,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(&platform, config);

    let running = orchestrator.submit(kindle_to_kobo()).unwrap();
    let queued = orchestrator.submit(kindle_to_kobo()).unwrap();

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.job(running).unwrap().status, JobStatus::Cancelled);
    assert_eq!(orchestrator.job(queued).unwrap().status, JobStatus::Cancelled);
    assert!(matches!(
        orchestrator.submit(kindle_to_kobo()),
        Err(SyncError::Cancelled)
    ));
}
