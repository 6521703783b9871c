//! # Shelf Sync
//!
//! Async orchestration of library sync jobs on top of `shelf-engine`.
//!
//! A [`SyncOrchestrator`] takes a [`SyncRequest`], fetches every source and
//! target library through a [`RecordSource`], reconciles them with the
//! engine and writes the outcome through a [`RecordSink`]. Jobs report
//! their lifecycle through an [`EventNotifier`]; failed jobs can be
//! resubmitted with backoff by a [`RetryCoordinator`].
//!
//! Platform adapters are out of scope. [`InMemoryPlatform`] implements both
//! platform traits for the CLI and for tests.

pub mod config;
pub mod error;
pub mod job;
pub mod memory;
pub mod notifier;
pub mod orchestrator;
pub mod platform;
pub mod retry;

pub use config::{Config, ConfigError};
pub use error::{Result, SyncError};
pub use job::{
    ConflictOutcome, ConflictStatus, FailureReport, JobReport, JobStatus, NextAction,
    ResourceKind, RollbackReport, RolledBackResource, SyncJob, SyncRequest, TargetReport,
};
pub use memory::InMemoryPlatform;
pub use notifier::{EventNotifier, NotificationHub, Stage, SyncEvent, TracingNotifier};
pub use orchestrator::SyncOrchestrator;
pub use platform::{PlatformError, RecordSink, RecordSource};
pub use retry::{RetryCoordinator, RetryHandle, RetryStatsSnapshot};
