//! Conflict detection on modified records.
//!
//! Detection is rule based. Each [`DetectionRule`] owns one field (or none,
//! for fallbacks) and inspects the change to that field together with both
//! record snapshots. Rules that own a field take precedence; changes to
//! fields nobody owns go to the fallback rules.
//!
//! When one record trips several rules the individual conflicts are folded
//! into a single composite conflict that always requires manual
//! intervention. Detection is a pure function of its inputs.

use crate::{
    diff::{progress_severity, DiffResult, FieldChange, ModifiedEntry, PROGRESS_HIGH_DELTA},
    record::fields,
    ReconcileConfig, RecordId, Severity, StrategyKind, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Title similarity under which a divergence is HIGH severity.
const TITLE_HIGH_SIMILARITY: f64 = 0.5;

/// Classification of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    ProgressMismatch,
    TitleDivergence,
    TimestampConflict,
    /// Generic high-severity change on a field without a dedicated rule
    FieldMismatch,
    CompositeConflict,
}

impl ConflictType {
    /// Ordering weight when several conflicts compete for a composite.
    pub fn priority(self) -> u8 {
        match self {
            ConflictType::CompositeConflict => 5,
            ConflictType::TitleDivergence => 4,
            ConflictType::ProgressMismatch => 3,
            ConflictType::TimestampConflict => 2,
            ConflictType::FieldMismatch => 1,
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictType::ProgressMismatch => "PROGRESS_MISMATCH",
            ConflictType::TitleDivergence => "TITLE_DIVERGENCE",
            ConflictType::TimestampConflict => "TIMESTAMP_CONFLICT",
            ConflictType::FieldMismatch => "FIELD_MISMATCH",
            ConflictType::CompositeConflict => "COMPOSITE_CONFLICT",
        };
        f.write_str(name)
    }
}

/// A classified disagreement between source and target for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Deterministic id: `<itemId>:<field>`
    pub id: String,
    pub item_id: RecordId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub field: String,
    pub severity: Severity,
    pub source_value: Value,
    pub target_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_updated: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_updated: Option<Timestamp>,
    /// Detection confidence in [0, 1]
    pub confidence: f64,
    pub auto_resolvable: bool,
    pub recommended_strategy: StrategyKind,
    /// Folded conflicts, only set on composites
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_conflicts: Vec<Conflict>,
}

impl Conflict {
    fn from_change(
        entry: &ModifiedEntry,
        change: &FieldChange,
        conflict_type: ConflictType,
        severity: Severity,
        confidence: f64,
        recommended_strategy: StrategyKind,
    ) -> Self {
        Self {
            id: format!("{}:{}", entry.id, change.field),
            item_id: entry.id.clone(),
            conflict_type,
            field: change.field.clone(),
            severity,
            source_value: change.to.clone(),
            target_value: change.from.clone(),
            source_updated: entry.source.last_updated,
            target_updated: entry.target.last_updated,
            confidence: confidence.clamp(0.0, 1.0),
            auto_resolvable: !recommended_strategy.is_manual(),
            recommended_strategy,
            sub_conflicts: Vec::new(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.conflict_type == ConflictType::CompositeConflict
    }

    /// Source and target values as numbers, when both are numeric.
    pub fn numeric_values(&self) -> Option<(f64, f64)> {
        Some((self.source_value.as_f64()?, self.target_value.as_f64()?))
    }
}

/// Thresholds used by the built-in rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    pub progress_conflict: f64,
    pub title_similarity: f64,
    pub timestamp_window_ms: u64,
    pub max_composite_conflicts: usize,
}

impl From<&ReconcileConfig> for DetectionThresholds {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            progress_conflict: config.progress_conflict_threshold,
            title_similarity: config.title_similarity_threshold,
            timestamp_window_ms: config.timestamp_conflict_window,
            max_composite_conflicts: config.max_composite_conflicts,
        }
    }
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

/// A single detection rule.
pub trait DetectionRule: Send + Sync {
    /// Rule name, for diagnostics.
    fn name(&self) -> &str;

    /// The field this rule owns. `None` marks a fallback rule.
    fn field(&self) -> Option<&str>;

    /// Inspect one changed field of a modified record.
    fn detect(
        &self,
        change: &FieldChange,
        entry: &ModifiedEntry,
        thresholds: &DetectionThresholds,
    ) -> Option<Conflict>;
}

/// Rules shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRule {
    ProgressMismatch,
    TitleDivergence,
    TimestampConflict,
    /// Any other HIGH severity change
    HighSeverityFallback,
}

impl BuiltinRule {
    pub const ALL: [BuiltinRule; 4] = [
        BuiltinRule::ProgressMismatch,
        BuiltinRule::TitleDivergence,
        BuiltinRule::TimestampConflict,
        BuiltinRule::HighSeverityFallback,
    ];
}

impl DetectionRule for BuiltinRule {
    fn name(&self) -> &str {
        match self {
            BuiltinRule::ProgressMismatch => "progress-mismatch",
            BuiltinRule::TitleDivergence => "title-divergence",
            BuiltinRule::TimestampConflict => "timestamp-conflict",
            BuiltinRule::HighSeverityFallback => "high-severity-fallback",
        }
    }

    fn field(&self) -> Option<&str> {
        match self {
            BuiltinRule::ProgressMismatch => Some(fields::PROGRESS),
            BuiltinRule::TitleDivergence => Some(fields::TITLE),
            BuiltinRule::TimestampConflict => Some(fields::LAST_UPDATED),
            BuiltinRule::HighSeverityFallback => None,
        }
    }

    fn detect(
        &self,
        change: &FieldChange,
        entry: &ModifiedEntry,
        thresholds: &DetectionThresholds,
    ) -> Option<Conflict> {
        match self {
            BuiltinRule::ProgressMismatch => detect_progress(change, entry, thresholds),
            BuiltinRule::TitleDivergence => detect_title(change, entry, thresholds),
            BuiltinRule::TimestampConflict => detect_timestamp(change, entry, thresholds),
            BuiltinRule::HighSeverityFallback => (change.severity >= Severity::High).then(|| {
                Conflict::from_change(
                    entry,
                    change,
                    ConflictType::FieldMismatch,
                    change.severity,
                    0.6,
                    StrategyKind::ManualReview,
                )
            }),
        }
    }
}

fn detect_progress(
    change: &FieldChange,
    entry: &ModifiedEntry,
    thresholds: &DetectionThresholds,
) -> Option<Conflict> {
    let (source, target) = (entry.source.progress?, entry.target.progress?);
    let delta = (source - target).abs();
    if delta < thresholds.progress_conflict {
        return None;
    }

    let strategy = if delta >= PROGRESS_HIGH_DELTA {
        StrategyKind::ManualReview
    } else {
        StrategyKind::UseHigherProgress
    };
    Some(Conflict::from_change(
        entry,
        change,
        ConflictType::ProgressMismatch,
        progress_severity(delta),
        0.5 + delta / 200.0,
        strategy,
    ))
}

fn detect_title(
    change: &FieldChange,
    entry: &ModifiedEntry,
    thresholds: &DetectionThresholds,
) -> Option<Conflict> {
    if entry.source.title == entry.target.title {
        return None;
    }
    let similarity = title_similarity(&entry.source.title, &entry.target.title);
    if similarity >= thresholds.title_similarity {
        return None;
    }

    let (severity, strategy) = if similarity < TITLE_HIGH_SIMILARITY {
        (Severity::High, StrategyKind::ManualReview)
    } else {
        (Severity::Medium, StrategyKind::UseSourcePriority)
    };
    Some(Conflict::from_change(
        entry,
        change,
        ConflictType::TitleDivergence,
        severity,
        1.0 - similarity,
        strategy,
    ))
}

fn detect_timestamp(
    change: &FieldChange,
    entry: &ModifiedEntry,
    thresholds: &DetectionThresholds,
) -> Option<Conflict> {
    let (source, target) = (entry.source.last_updated?, entry.target.last_updated?);
    let delta = source.abs_diff(target);
    if delta > thresholds.timestamp_window_ms {
        return None;
    }

    let severity = if delta > DAY_MS {
        Severity::High
    } else {
        Severity::Low
    };
    let confidence = if thresholds.timestamp_window_ms == 0 {
        1.0
    } else {
        1.0 - delta as f64 / thresholds.timestamp_window_ms as f64
    };
    Some(Conflict::from_change(
        entry,
        change,
        ConflictType::TimestampConflict,
        severity,
        confidence,
        StrategyKind::UseLatestTimestamp,
    ))
}

/// Normalized edit-distance similarity of two titles, in [0, 1].
///
/// Case and runs of whitespace are ignored.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_title(a), &normalize_title(b))
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Runs the registered rules over modified records.
pub struct ConflictDetector {
    rules: Vec<Box<dyn DetectionRule>>,
    thresholds: DetectionThresholds,
}

impl std::fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictDetector")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(DetectionThresholds::default())
    }
}

impl ConflictDetector {
    /// Create a detector with the built-in rules registered.
    pub fn new(thresholds: DetectionThresholds) -> Self {
        let mut detector = Self::empty(thresholds);
        for rule in BuiltinRule::ALL {
            detector.register(rule);
        }
        detector
    }

    /// Create a detector with no rules.
    pub fn empty(thresholds: DetectionThresholds) -> Self {
        Self {
            rules: Vec::new(),
            thresholds,
        }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(DetectionThresholds::from(config))
    }

    /// Add a rule to the registration table.
    pub fn register(&mut self, rule: impl DetectionRule + 'static) -> &mut Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn thresholds(&self) -> &DetectionThresholds {
        &self.thresholds
    }

    /// Detect conflicts on one modified record.
    ///
    /// Returns `None` when no rule fires, the single conflict when one does,
    /// and a composite conflict otherwise.
    pub fn detect(&self, entry: &ModifiedEntry) -> Option<Conflict> {
        let mut found: Vec<Conflict> = Vec::new();

        for change in &entry.changes {
            let mut owners = self
                .rules
                .iter()
                .filter(|r| r.field() == Some(change.field.as_str()))
                .peekable();

            if owners.peek().is_some() {
                found.extend(owners.filter_map(|r| r.detect(change, entry, &self.thresholds)));
            } else {
                found.extend(
                    self.rules
                        .iter()
                        .filter(|r| r.field().is_none())
                        .filter_map(|r| r.detect(change, entry, &self.thresholds)),
                );
            }
        }

        match found.len() {
            0 => None,
            1 => found.pop(),
            _ if self.thresholds.max_composite_conflicts < 2 => found
                .into_iter()
                .min_by_key(|c| std::cmp::Reverse(c.conflict_type.priority())),
            _ => Some(self.composite(entry, found)),
        }
    }

    /// Detect conflicts across every modified record of a diff.
    pub fn detect_all(&self, diff: &DiffResult) -> Vec<Conflict> {
        diff.modified.iter().filter_map(|e| self.detect(e)).collect()
    }

    fn composite(&self, entry: &ModifiedEntry, mut subs: Vec<Conflict>) -> Conflict {
        subs.sort_by_key(|c| std::cmp::Reverse(c.conflict_type.priority()));
        subs.truncate(self.thresholds.max_composite_conflicts);

        let severity = subs
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or_default()
            .escalate();
        let confidence = subs.iter().map(|c| c.confidence).sum::<f64>() / subs.len() as f64;

        let mut source_value = Map::new();
        let mut target_value = Map::new();
        for sub in &subs {
            source_value.insert(sub.field.clone(), sub.source_value.clone());
            target_value.insert(sub.field.clone(), sub.target_value.clone());
        }
        let field = subs
            .iter()
            .map(|c| c.field.as_str())
            .collect::<Vec<_>>()
            .join(",");

        Conflict {
            id: format!("{}:composite", entry.id),
            item_id: entry.id.clone(),
            conflict_type: ConflictType::CompositeConflict,
            field,
            severity,
            source_value: Value::Object(source_value),
            target_value: Value::Object(target_value),
            source_updated: entry.source.last_updated,
            target_updated: entry.target.last_updated,
            confidence,
            auto_resolvable: false,
            recommended_strategy: StrategyKind::ManualIntervention,
            sub_conflicts: subs,
        }
    }
}
