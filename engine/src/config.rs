//! Reconciliation options.
//!
//! A flat options object with camelCase keys. Every key is optional and
//! unknown keys are ignored, so partial JSON documents are valid configs.

use crate::{
    diff::DiffOptions,
    error::Result,
    record::fields,
    retry::RetryPolicy,
    Error, PlatformId,
};
use serde::{Deserialize, Serialize};

/// Default progress delta (percentage points) that counts as a conflict.
pub const DEFAULT_PROGRESS_CONFLICT_THRESHOLD: f64 = 15.0;
/// Default minimum normalized title similarity.
pub const DEFAULT_TITLE_SIMILARITY_THRESHOLD: f64 = 0.8;
/// Default concurrent-write window in milliseconds.
pub const DEFAULT_TIMESTAMP_CONFLICT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;
pub const DEFAULT_AUTO_RESOLVE_THRESHOLD: f64 = 0.85;
pub const DEFAULT_MAX_CONCURRENT_SYNCS: usize = 3;
pub const DEFAULT_MAX_COMPOSITE_CONFLICTS: usize = 2;

/// All recognized reconciliation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileConfig {
    pub progress_conflict_threshold: f64,
    pub title_similarity_threshold: f64,
    /// Milliseconds
    pub timestamp_conflict_window: u64,
    pub max_retry_attempts: u32,
    /// Milliseconds
    pub base_delay: u64,
    /// Milliseconds
    pub max_delay: u64,
    pub jitter_factor: f64,
    pub auto_resolve_threshold: f64,
    pub max_concurrent_syncs: usize,
    pub max_composite_conflicts: usize,
    pub compare_fields: Vec<String>,
    pub case_sensitive: bool,
    pub numeric_tolerance: f64,
    /// Platforms whose values win under `USE_SOURCE_PRIORITY`
    pub source_priority: Vec<PlatformId>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            progress_conflict_threshold: DEFAULT_PROGRESS_CONFLICT_THRESHOLD,
            title_similarity_threshold: DEFAULT_TITLE_SIMILARITY_THRESHOLD,
            timestamp_conflict_window: DEFAULT_TIMESTAMP_CONFLICT_WINDOW_MS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY_MS,
            max_delay: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            auto_resolve_threshold: DEFAULT_AUTO_RESOLVE_THRESHOLD,
            max_concurrent_syncs: DEFAULT_MAX_CONCURRENT_SYNCS,
            max_composite_conflicts: DEFAULT_MAX_COMPOSITE_CONFLICTS,
            compare_fields: default_compare_fields(),
            case_sensitive: true,
            numeric_tolerance: 0.0,
            source_priority: Vec::new(),
        }
    }
}

fn default_compare_fields() -> Vec<String> {
    [
        fields::TITLE,
        fields::PROGRESS,
        fields::LAST_UPDATED,
        fields::AUTHORS,
        fields::TAGS,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl ReconcileConfig {
    /// Parse and validate a JSON options document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::MalformedConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(self.progress_conflict_threshold >= 0.0 && self.progress_conflict_threshold <= 100.0)
        {
            return Err(Error::invalid_config(
                "progressConflictThreshold",
                "must be within 0..=100",
            ));
        }
        for (key, value) in [
            ("titleSimilarityThreshold", self.title_similarity_threshold),
            ("jitterFactor", self.jitter_factor),
            ("autoResolveThreshold", self.auto_resolve_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::invalid_config(key, "must be within 0..=1"));
            }
        }
        if !(self.numeric_tolerance >= 0.0 && self.numeric_tolerance.is_finite()) {
            return Err(Error::invalid_config(
                "numericTolerance",
                "must be a non-negative number",
            ));
        }
        if self.max_concurrent_syncs == 0 {
            return Err(Error::invalid_config(
                "maxConcurrentSyncs",
                "must be at least 1",
            ));
        }
        if self.max_composite_conflicts < 2 {
            return Err(Error::invalid_config(
                "maxCompositeConflicts",
                "must be at least 2",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::invalid_config(
                "baseDelay",
                "must not exceed maxDelay",
            ));
        }
        Ok(())
    }

    /// Options for the diff engine.
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            compare_fields: self.compare_fields.clone(),
            case_sensitive: self.case_sensitive,
            numeric_tolerance: self.numeric_tolerance,
        }
    }

    /// Retry policy derived from the retry keys.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: self.max_retry_attempts,
            base_delay_ms: self.base_delay,
            max_delay_ms: self.max_delay,
            jitter_factor: self.jitter_factor,
        }
    }
}
