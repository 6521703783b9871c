//! Resolution strategy selection for detected conflicts.
//!
//! Every registered [`ResolutionStrategy`] declares whether it applies to a
//! conflict and how confident it is. The engine ranks the applicable ones and
//! auto-applies the best when its confidence clears the configured threshold;
//! anything else is deferred to manual review.

use crate::{
    conflict::{Conflict, ConflictType},
    error::Result,
    Error, PlatformId, ReconcileConfig, Severity,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Named resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    UseLatestTimestamp,
    UseSourcePriority,
    IntelligentMerge,
    UseHigherProgress,
    ManualReview,
    ManualIntervention,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::UseLatestTimestamp,
        StrategyKind::UseSourcePriority,
        StrategyKind::IntelligentMerge,
        StrategyKind::UseHigherProgress,
        StrategyKind::ManualReview,
        StrategyKind::ManualIntervention,
    ];

    /// Whether this strategy hands the conflict to a person.
    pub fn is_manual(self) -> bool {
        matches!(
            self,
            StrategyKind::ManualReview | StrategyKind::ManualIntervention
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::UseLatestTimestamp => "USE_LATEST_TIMESTAMP",
            StrategyKind::UseSourcePriority => "USE_SOURCE_PRIORITY",
            StrategyKind::IntelligentMerge => "INTELLIGENT_MERGE",
            StrategyKind::UseHigherProgress => "USE_HIGHER_PROGRESS",
            StrategyKind::ManualReview => "MANUAL_REVIEW",
            StrategyKind::ManualIntervention => "MANUAL_INTERVENTION",
        };
        f.write_str(name)
    }
}

/// Facts about the sync a conflict came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    pub source_platform: Option<PlatformId>,
    pub target_platform: Option<PlatformId>,
}

impl ResolutionContext {
    pub fn new(source: impl Into<PlatformId>, target: impl Into<PlatformId>) -> Self {
        Self {
            source_platform: Some(source.into()),
            target_platform: Some(target.into()),
        }
    }
}

/// A resolution policy.
pub trait ResolutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Static confidence in [0, 1].
    fn confidence(&self) -> f64;

    fn applicable(&self, conflict: &Conflict, context: &ResolutionContext) -> bool;

    /// Compute the resolved value. `None` means the strategy could not
    /// produce one.
    fn resolve(&self, conflict: &Conflict) -> Option<Value>;

    /// Human-readable explanation for a recommendation.
    fn reasoning(&self, conflict: &Conflict) -> String;
}

/// Strategies shipped with the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinStrategy {
    UseLatestTimestamp,
    /// Source wins when its platform is in the allow-list
    UseSourcePriority(Vec<PlatformId>),
    IntelligentMerge,
    UseHigherProgress,
    ManualReview,
}

impl ResolutionStrategy for BuiltinStrategy {
    fn kind(&self) -> StrategyKind {
        match self {
            BuiltinStrategy::UseLatestTimestamp => StrategyKind::UseLatestTimestamp,
            BuiltinStrategy::UseSourcePriority(_) => StrategyKind::UseSourcePriority,
            BuiltinStrategy::IntelligentMerge => StrategyKind::IntelligentMerge,
            BuiltinStrategy::UseHigherProgress => StrategyKind::UseHigherProgress,
            BuiltinStrategy::ManualReview => StrategyKind::ManualReview,
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            BuiltinStrategy::UseLatestTimestamp => 0.9,
            BuiltinStrategy::UseSourcePriority(_) => 0.75,
            BuiltinStrategy::IntelligentMerge => 0.7,
            BuiltinStrategy::UseHigherProgress => 0.85,
            BuiltinStrategy::ManualReview => 0.5,
        }
    }

    fn applicable(&self, conflict: &Conflict, context: &ResolutionContext) -> bool {
        match self {
            BuiltinStrategy::UseLatestTimestamp => {
                matches!(
                    conflict.conflict_type,
                    ConflictType::ProgressMismatch | ConflictType::TimestampConflict
                ) && conflict.source_updated.is_some()
                    && conflict.target_updated.is_some()
            }
            BuiltinStrategy::UseSourcePriority(priority) => {
                !conflict.is_composite()
                    && context
                        .source_platform
                        .as_ref()
                        .is_some_and(|p| priority.contains(p))
            }
            BuiltinStrategy::IntelligentMerge | BuiltinStrategy::UseHigherProgress => {
                conflict.conflict_type == ConflictType::ProgressMismatch
                    && conflict.numeric_values().is_some()
            }
            BuiltinStrategy::ManualReview => true,
        }
    }

    fn resolve(&self, conflict: &Conflict) -> Option<Value> {
        match self {
            BuiltinStrategy::UseLatestTimestamp => {
                let source_wins = conflict.source_updated? >= conflict.target_updated?;
                Some(if source_wins {
                    conflict.source_value.clone()
                } else {
                    conflict.target_value.clone()
                })
            }
            BuiltinStrategy::UseSourcePriority(_) => Some(conflict.source_value.clone()),
            BuiltinStrategy::IntelligentMerge => {
                let (source, target) = conflict.numeric_values()?;
                number((source + target) / 2.0)
            }
            BuiltinStrategy::UseHigherProgress => {
                let (source, target) = conflict.numeric_values()?;
                number(source.max(target))
            }
            BuiltinStrategy::ManualReview => None,
        }
    }

    fn reasoning(&self, conflict: &Conflict) -> String {
        match self {
            BuiltinStrategy::UseLatestTimestamp => {
                format!("keep the most recently updated value of '{}'", conflict.field)
            }
            BuiltinStrategy::UseSourcePriority(_) => {
                "source platform is in the priority list".to_string()
            }
            BuiltinStrategy::IntelligentMerge => "average both progress values".to_string(),
            BuiltinStrategy::UseHigherProgress => "keep the furthest reading position".to_string(),
            BuiltinStrategy::ManualReview => {
                format!("{} conflict needs a person to decide", conflict.conflict_type)
            }
        }
    }
}

fn number(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

/// Attempts and successes of one strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyOutcome {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Default)]
struct StrategyCounter {
    attempts: AtomicU64,
    successes: AtomicU64,
}

/// Per-strategy outcome counters, safe under concurrent increment.
///
/// Shared across jobs through an `Arc`; counters only ever grow until
/// [`StrategyStats::reset`].
#[derive(Debug, Default)]
pub struct StrategyStats {
    counters: [StrategyCounter; StrategyKind::ALL.len()],
}

impl StrategyStats {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, kind: StrategyKind, success: bool) {
        let counter = &self.counters[kind.index()];
        counter.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            counter.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn outcome(&self, kind: StrategyKind) -> StrategyOutcome {
        let counter = &self.counters[kind.index()];
        StrategyOutcome {
            attempts: counter.attempts.load(Ordering::Relaxed),
            successes: counter.successes.load(Ordering::Relaxed),
        }
    }

    /// Outcomes for every strategy that has been attempted.
    pub fn snapshot(&self) -> Vec<(StrategyKind, StrategyOutcome)> {
        StrategyKind::ALL
            .into_iter()
            .map(|kind| (kind, self.outcome(kind)))
            .filter(|(_, outcome)| outcome.attempts > 0)
            .collect()
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.attempts.store(0, Ordering::Relaxed);
            counter.successes.store(0, Ordering::Relaxed);
        }
    }
}

/// One candidate way to resolve a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecommendation {
    pub strategy: StrategyKind,
    pub confidence: f64,
    pub auto_resolvable: bool,
    pub reasoning: String,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub conflict_id: String,
    pub success: bool,
    /// Strategy that produced the value, when one was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<Value>,
    pub confidence: f64,
    /// Set when the conflict was deferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_strategy: Option<StrategyKind>,
    pub reasoning: String,
}

impl ResolutionResult {
    fn deferred(conflict: &Conflict, confidence: f64, reasoning: String) -> Self {
        Self {
            conflict_id: conflict.id.clone(),
            success: false,
            strategy: None,
            resolved_value: None,
            confidence,
            fallback_strategy: Some(StrategyKind::ManualReview),
            reasoning,
        }
    }

    /// Whether the conflict now waits for manual review.
    pub fn is_deferred(&self) -> bool {
        self.fallback_strategy.is_some()
    }
}

/// Aggregate outcome of a batch resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolution {
    pub auto_resolved: usize,
    pub manual_review_required: usize,
    pub failed: usize,
    /// True when the cancellation flag stopped the batch early
    pub cancelled: bool,
    pub results: Vec<ResolutionResult>,
}

/// Ranks strategies and applies them to conflicts.
pub struct ResolutionEngine {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    auto_resolve_threshold: f64,
    stats: Arc<StrategyStats>,
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            )
            .field("auto_resolve_threshold", &self.auto_resolve_threshold)
            .finish()
    }
}

impl ResolutionEngine {
    /// Create an engine with the built-in strategies registered.
    pub fn new(config: &ReconcileConfig, stats: Arc<StrategyStats>) -> Self {
        let mut engine = Self::empty(config.auto_resolve_threshold, stats);
        engine
            .register(BuiltinStrategy::UseLatestTimestamp)
            .register(BuiltinStrategy::UseSourcePriority(
                config.source_priority.clone(),
            ))
            .register(BuiltinStrategy::IntelligentMerge)
            .register(BuiltinStrategy::UseHigherProgress)
            .register(BuiltinStrategy::ManualReview);
        engine
    }

    /// Create an engine with no strategies.
    pub fn empty(auto_resolve_threshold: f64, stats: Arc<StrategyStats>) -> Self {
        Self {
            strategies: Vec::new(),
            auto_resolve_threshold,
            stats,
        }
    }

    /// Add a strategy to the registration table.
    pub fn register(&mut self, strategy: impl ResolutionStrategy + 'static) -> &mut Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn auto_resolve_threshold(&self) -> f64 {
        self.auto_resolve_threshold
    }

    pub fn stats(&self) -> &Arc<StrategyStats> {
        &self.stats
    }

    fn strategy(&self, kind: StrategyKind) -> Option<&dyn ResolutionStrategy> {
        self.strategies
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| &**s)
    }

    /// Whether policy allows this conflict to be resolved without a person.
    fn may_auto_resolve(&self, conflict: &Conflict, strategy: &dyn ResolutionStrategy) -> bool {
        conflict.severity != Severity::Critical
            && conflict.auto_resolvable
            && !strategy.kind().is_manual()
            && strategy.confidence() >= self.auto_resolve_threshold
    }

    /// Recommendations from every applicable strategy, best first.
    ///
    /// Ranked by confidence, then historical success rate, then
    /// registration order.
    pub fn recommend(
        &self,
        conflict: &Conflict,
        context: &ResolutionContext,
    ) -> Vec<ResolutionRecommendation> {
        let mut ranked: Vec<(&dyn ResolutionStrategy, f64)> = self
            .strategies
            .iter()
            .filter(|s| s.applicable(conflict, context))
            .map(|s| (&**s, self.stats.outcome(s.kind()).success_rate()))
            .collect();

        ranked.sort_by(|(a, a_rate), (b, b_rate)| {
            b.confidence()
                .total_cmp(&a.confidence())
                .then(b_rate.total_cmp(a_rate))
        });

        ranked
            .into_iter()
            .map(|(strategy, _)| ResolutionRecommendation {
                strategy: strategy.kind(),
                confidence: strategy.confidence(),
                auto_resolvable: self.may_auto_resolve(conflict, strategy),
                reasoning: strategy.reasoning(conflict),
            })
            .collect()
    }

    /// Resolve a conflict with the best recommendation, or defer it.
    pub fn auto_resolve(
        &self,
        conflict: &Conflict,
        context: &ResolutionContext,
    ) -> ResolutionResult {
        let Some(best) = self.recommend(conflict, context).into_iter().next() else {
            return ResolutionResult::deferred(conflict, 0.0, "no applicable strategy".into());
        };

        if conflict.severity == Severity::Critical {
            return ResolutionResult::deferred(
                conflict,
                best.confidence,
                "critical conflicts always need manual review".into(),
            );
        }
        if !best.auto_resolvable {
            let reasoning = if best.confidence < self.auto_resolve_threshold {
                format!(
                    "best confidence {:.2} ({}) is below the auto-resolve threshold {:.2}",
                    best.confidence, best.strategy, self.auto_resolve_threshold
                )
            } else {
                best.reasoning
            };
            return ResolutionResult::deferred(conflict, best.confidence, reasoning);
        }

        match self.strategy(best.strategy) {
            Some(strategy) => self.apply(conflict, strategy),
            None => ResolutionResult::deferred(conflict, 0.0, "no applicable strategy".into()),
        }
    }

    /// Apply one specific strategy, bypassing ranking.
    pub fn resolve_with(
        &self,
        conflict: &Conflict,
        kind: StrategyKind,
        context: &ResolutionContext,
    ) -> Result<ResolutionResult> {
        let strategy = self
            .strategy(kind)
            .ok_or_else(|| Error::UnknownStrategy(kind.to_string()))?;

        if kind.is_manual() {
            return Ok(ResolutionResult::deferred(
                conflict,
                strategy.confidence(),
                strategy.reasoning(conflict),
            ));
        }
        if !strategy.applicable(conflict, context) {
            return Ok(ResolutionResult {
                conflict_id: conflict.id.clone(),
                success: false,
                strategy: Some(kind),
                resolved_value: None,
                confidence: 0.0,
                fallback_strategy: None,
                reasoning: format!("{kind} does not apply to {}", conflict.conflict_type),
            });
        }
        Ok(self.apply(conflict, strategy))
    }

    fn apply(&self, conflict: &Conflict, strategy: &dyn ResolutionStrategy) -> ResolutionResult {
        let resolved = strategy.resolve(conflict);
        let success = resolved.is_some();
        self.stats.record(strategy.kind(), success);

        ResolutionResult {
            conflict_id: conflict.id.clone(),
            success,
            strategy: Some(strategy.kind()),
            resolved_value: resolved,
            confidence: strategy.confidence(),
            fallback_strategy: None,
            reasoning: if success {
                strategy.reasoning(conflict)
            } else {
                format!("{} produced no value", strategy.kind())
            },
        }
    }

    /// Resolve many conflicts, checking `cancelled` between items.
    ///
    /// With `strategy` set every conflict is resolved with that strategy;
    /// otherwise each one goes through [`ResolutionEngine::auto_resolve`].
    pub fn execute_batch_resolution(
        &self,
        conflicts: &[Conflict],
        strategy: Option<StrategyKind>,
        context: &ResolutionContext,
        cancelled: &AtomicBool,
    ) -> Result<BatchResolution> {
        let mut batch = BatchResolution::default();

        for conflict in conflicts {
            if cancelled.load(Ordering::Acquire) {
                batch.cancelled = true;
                break;
            }

            let result = match strategy {
                Some(kind) => self.resolve_with(conflict, kind, context)?,
                None => self.auto_resolve(conflict, context),
            };

            if result.success {
                batch.auto_resolved += 1;
            } else if result.is_deferred() {
                batch.manual_review_required += 1;
            } else {
                batch.failed += 1;
            }
            batch.results.push(result);
        }

        Ok(batch)
    }
}
