//! Retry policy: failure classification, backoff selection and delay math.
//!
//! Everything here is deterministic. Jitter is applied from a caller
//! supplied sample so timers and randomness stay outside the engine.

use crate::ReconcileConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broad class of a failed job's error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Network,
    DataConflict,
    Authorization,
    ServerError,
    Unknown,
}

const AUTHORIZATION_KEYWORDS: &[&str] = &["permission", "denied", "unauthorized", "forbidden"];
const NETWORK_KEYWORDS: &[&str] = &["network", "timeout", "connection"];
const CONFLICT_KEYWORDS: &[&str] = &["conflict", "duplicate"];
const SERVER_KEYWORDS: &[&str] = &["server", "500"];

impl FailureCategory {
    /// Classify an error message by keyword.
    ///
    /// Authorization keywords are checked first so a message that also
    /// mentions the network is never retried.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| message.contains(k));

        if has_any(AUTHORIZATION_KEYWORDS) {
            FailureCategory::Authorization
        } else if has_any(NETWORK_KEYWORDS) {
            FailureCategory::Network
        } else if has_any(CONFLICT_KEYWORDS) {
            FailureCategory::DataConflict
        } else if has_any(SERVER_KEYWORDS) {
            FailureCategory::ServerError
        } else {
            FailureCategory::Unknown
        }
    }

    pub fn is_retryable(self) -> bool {
        self != FailureCategory::Authorization
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::Network => "NETWORK",
            FailureCategory::DataConflict => "DATA_CONFLICT",
            FailureCategory::Authorization => "AUTHORIZATION",
            FailureCategory::ServerError => "SERVER_ERROR",
            FailureCategory::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    ExponentialBackoff,
    LinearBackoff,
    /// Short fixed delay so conflict handling can run first
    ConflictResolutionFirst,
}

impl BackoffStrategy {
    /// Whether jitter is added to delays of this strategy.
    pub fn is_jittered(self) -> bool {
        self != BackoffStrategy::ConflictResolutionFirst
    }
}

/// Classified failure of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryableFailure {
    pub category: FailureCategory,
    pub retryable: bool,
    /// Unjittered first delay of the selected strategy, in milliseconds
    pub recommended_delay: u64,
}

/// Retry limits and delay parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter amplitude as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ReconcileConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retry_count` retries that
    /// ended with `error`.
    pub fn can_retry(&self, retry_count: u32, error: Option<&str>) -> bool {
        retry_count < self.max_retry_attempts && self.analyze(error).retryable
    }

    /// Classify an error. A missing error classifies as unknown.
    pub fn analyze(&self, error: Option<&str>) -> RetryableFailure {
        let category = error.map_or(FailureCategory::Unknown, FailureCategory::classify);
        let strategy = Self::strategy_for(category);
        RetryableFailure {
            category,
            retryable: category.is_retryable(),
            recommended_delay: duration_ms(self.base_delay(0, strategy)),
        }
    }

    /// Backoff strategy for a classified failure.
    pub fn select_strategy(&self, failure: &RetryableFailure) -> BackoffStrategy {
        Self::strategy_for(failure.category)
    }

    fn strategy_for(category: FailureCategory) -> BackoffStrategy {
        match category {
            FailureCategory::Network => BackoffStrategy::ExponentialBackoff,
            FailureCategory::DataConflict => BackoffStrategy::ConflictResolutionFirst,
            FailureCategory::ServerError
            | FailureCategory::Authorization
            | FailureCategory::Unknown => BackoffStrategy::LinearBackoff,
        }
    }

    /// Unjittered delay before retry number `retry_count` (0-based).
    pub fn base_delay(&self, retry_count: u32, strategy: BackoffStrategy) -> Duration {
        let base = self.base_delay_ms;
        let delay = match strategy {
            BackoffStrategy::ExponentialBackoff => {
                base.saturating_mul(2u64.saturating_pow(retry_count))
            }
            BackoffStrategy::LinearBackoff => base.saturating_mul(u64::from(retry_count) + 1),
            BackoffStrategy::ConflictResolutionFirst => base / 2,
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay with jitter applied from `sample`, a value in [-1, 1].
    ///
    /// The result lies within `delay ± jitter_factor * delay`. Strategies
    /// that are not jittered ignore the sample.
    pub fn jittered_delay(
        &self,
        retry_count: u32,
        strategy: BackoffStrategy,
        sample: f64,
    ) -> Duration {
        let delay = self.base_delay(retry_count, strategy);
        if !strategy.is_jittered() {
            return delay;
        }
        let base_ms = delay.as_millis() as f64;
        let jitter = base_ms * self.jitter_factor * sample.clamp(-1.0, 1.0);
        Duration::from_millis((base_ms + jitter).max(0.0).round() as u64)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
