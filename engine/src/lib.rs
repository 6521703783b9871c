//! # Shelf Engine
//!
//! A deterministic reconciliation engine for e-book library state.
//!
//! The same library is observed on several independently updated platforms.
//! This crate compares those observations, classifies the disagreements and
//! decides how each one should be settled. It performs no I/O and owns no
//! timers: the async orchestration lives in the `shelf-sync` crate.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platforms
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Pluggable**: Detection rules and resolution strategies are trait
//!   objects in registration tables
//!
//! ## Pipeline
//!
//! 1. [`diff`] partitions source and target [`RecordSet`]s into added,
//!    modified, deleted and unchanged records
//! 2. [`ConflictDetector`] runs its rules over every modified record and
//!    folds multiple hits into one composite conflict
//! 3. [`ResolutionEngine`] ranks the applicable strategies for a conflict
//!    and either resolves it or defers it to manual review
//! 4. [`plan_changes`] turns the result into a [`ChangeSet`] under a
//!    [`MergePolicy`]
//!
//! Failed jobs are classified by [`RetryPolicy`], which also computes the
//! backoff delay for the next attempt.
//!
//! ## Quick Start
//!
//! ```rust
//! use shelf_engine::{
//!     diff, ConflictDetector, Record, RecordSet, ReconcileConfig,
//!     ResolutionContext, ResolutionEngine, StrategyKind, StrategyStats,
//! };
//! use serde_json::json;
//!
//! let config = ReconcileConfig::default();
//! let source = RecordSet::new(vec![Record::new("book-1", "Dune").with_progress(70.0)]);
//! let target = RecordSet::new(vec![Record::new("book-1", "Dune").with_progress(40.0)]);
//!
//! let result = diff(&source, &target, &config.diff_options());
//! assert_eq!(result.modified.len(), 1);
//!
//! let conflicts = ConflictDetector::from_config(&config).detect_all(&result);
//! assert_eq!(conflicts.len(), 1);
//!
//! let engine = ResolutionEngine::new(&config, StrategyStats::new_shared());
//! let context = ResolutionContext::new("kindle", "kobo");
//! let resolution = engine.auto_resolve(&conflicts[0], &context);
//! assert!(resolution.success);
//! assert_eq!(resolution.strategy, Some(StrategyKind::UseHigherProgress));
//! assert_eq!(resolution.resolved_value, Some(json!(70.0)));
//! ```

pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod merge;
pub mod record;
pub mod resolution;
pub mod retry;
pub mod severity;

// Re-export main types at crate root
pub use config::ReconcileConfig;
pub use conflict::{
    title_similarity, BuiltinRule, Conflict, ConflictDetector, ConflictType, DetectionRule,
    DetectionThresholds,
};
pub use diff::{
    diff, ChangeType, DiffEngine, DiffOptions, DiffResult, DiffSummary, FieldChange,
    ModifiedEntry,
};
pub use error::Error;
pub use merge::{
    plan_changes, ApplyResult, ChangeCategory, ChangePlan, ChangeSet, MergePolicy, SkippedChange,
};
pub use record::{Record, RecordSet};
pub use resolution::{
    BatchResolution, BuiltinStrategy, ResolutionContext, ResolutionEngine,
    ResolutionRecommendation, ResolutionResult, ResolutionStrategy, StrategyKind,
    StrategyOutcome, StrategyStats,
};
pub use retry::{BackoffStrategy, FailureCategory, RetryPolicy, RetryableFailure};
pub use severity::Severity;

/// Type aliases for clarity
pub type RecordId = String;
pub type PlatformId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
