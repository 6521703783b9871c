//! Lifecycle notifications.
//!
//! Publishing is fire-and-forget: a notifier must never fail a job, so
//! [`EventNotifier::notify`] returns nothing and swallows delivery errors.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shelf_engine::{BackoffStrategy, Severity, StrategyKind};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pipeline stage a job has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Diff,
    Detect,
    Resolve,
    Apply,
}

impl Stage {
    /// Job progress once this stage is done.
    pub fn progress(self) -> u8 {
        match self {
            Stage::Fetch => 20,
            Stage::Diff => 40,
            Stage::Detect => 60,
            Stage::Resolve => 80,
            Stage::Apply => 100,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Diff => "diff",
            Stage::Detect => "detect",
            Stage::Resolve => "resolve",
            Stage::Apply => "apply",
        })
    }
}

/// Events published by the orchestrator and retry coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Job is waiting for a concurrency slot.
    JobQueued { job_id: Uuid, position: usize },

    JobStarted { job_id: Uuid },

    /// A pipeline checkpoint was reached.
    JobProgress {
        job_id: Uuid,
        stage: Stage,
        progress: u8,
    },

    JobCompleted { job_id: Uuid },

    JobFailed { job_id: Uuid, error: String },

    JobCancelled { job_id: Uuid },

    ConflictDetected {
        job_id: Uuid,
        conflict_id: String,
        item_id: String,
        severity: Severity,
    },

    ConflictResolved {
        job_id: Uuid,
        conflict_id: String,
        strategy: StrategyKind,
    },

    /// A failed job will be resubmitted after `delay_ms`.
    RetryScheduled {
        job_id: Uuid,
        retry_count: u32,
        delay_ms: u64,
        strategy: BackoffStrategy,
    },
}

impl SyncEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            SyncEvent::JobQueued { job_id, .. }
            | SyncEvent::JobStarted { job_id }
            | SyncEvent::JobProgress { job_id, .. }
            | SyncEvent::JobCompleted { job_id }
            | SyncEvent::JobFailed { job_id, .. }
            | SyncEvent::JobCancelled { job_id }
            | SyncEvent::ConflictDetected { job_id, .. }
            | SyncEvent::ConflictResolved { job_id, .. }
            | SyncEvent::RetryScheduled { job_id, .. } => *job_id,
        }
    }
}

/// Receives lifecycle events.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// Publishes events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl EventNotifier for TracingNotifier {
    fn notify(&self, event: SyncEvent) {
        match &event {
            SyncEvent::JobFailed { job_id, error } => {
                tracing::warn!(job_id = %job_id, error = %error, "Job failed");
            }
            SyncEvent::ConflictDetected {
                job_id,
                conflict_id,
                severity,
                ..
            } => {
                tracing::info!(job_id = %job_id, conflict_id = %conflict_id, severity = %severity, "Conflict detected");
            }
            SyncEvent::JobProgress {
                job_id,
                stage,
                progress,
            } => {
                tracing::debug!(job_id = %job_id, stage = %stage, progress, "Job progress");
            }
            other => {
                tracing::info!(job_id = %other.job_id(), event = ?other, "Sync event");
            }
        }
    }
}

/// Sender half handed out to subscribers.
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// Fans events out to subscribed channels.
///
/// Thread-safe and can be shared via `Arc`. Subscribers whose receiver was
/// dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct NotificationHub {
    subscribers: DashMap<Uuid, EventSender>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Create a new hub wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber.
    ///
    /// Returns the subscriber id and the receiving end of its channel.
    pub fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        tracing::debug!(subscriber = %id, "Event subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.subscribers.remove(id).is_some() {
            tracing::debug!(subscriber = %id, "Event subscriber removed");
        }
    }

    /// Publish to every subscriber.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_ok() {
                sent += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }
        sent
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl EventNotifier for NotificationHub {
    fn notify(&self, event: SyncEvent) {
        self.publish(event);
    }
}
