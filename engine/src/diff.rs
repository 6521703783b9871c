//! Diff computation between two record sets.
//!
//! # Algorithm
//!
//! 1. Index the target set by id (first occurrence wins)
//! 2. Walk the source set in order, classifying each id as added,
//!    modified or unchanged by comparing the configured fields
//! 3. Walk the target set in order, collecting ids the source never had
//!    as deleted
//!
//! Every valid id from either side lands in exactly one partition. Entries
//! that fail validation, and repeated ids, are counted in `skipped`. An
//! invalid entry that still carries an id quarantines that id on both
//! sides, so a malformed capture never shows up as a deletion.

use crate::{record::fields, Record, RecordId, RecordSet, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Progress delta at which a field change becomes HIGH severity.
pub const PROGRESS_HIGH_DELTA: f64 = 50.0;
/// Progress delta at which a field change becomes MEDIUM severity.
pub const PROGRESS_MEDIUM_DELTA: f64 = 30.0;

/// How fields are compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    /// Fields that take part in the comparison
    pub compare_fields: Vec<String>,
    /// When false, strings equal ignoring case are treated as unchanged
    pub case_sensitive: bool,
    /// Maximum numeric difference still considered equal
    pub numeric_tolerance: f64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        crate::ReconcileConfig::default().diff_options()
    }
}

/// Kind of change to a single field, read from target towards source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// The target lacked a value the source has
    Added,
    /// The source lacks a value the target has
    Removed,
    /// Both sides have differing values
    Updated,
}

/// A single changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    /// Target value
    pub from: Value,
    /// Source value
    pub to: Value,
    pub change_type: ChangeType,
    pub severity: Severity,
}

/// A record present on both sides with at least one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedEntry {
    pub id: RecordId,
    pub source: Record,
    pub target: Record,
    pub changes: Vec<FieldChange>,
}

impl ModifiedEntry {
    /// Find the change for a field, if it changed.
    pub fn change(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == field)
    }

    /// Highest severity among the changed fields.
    pub fn max_severity(&self) -> Severity {
        self.changes
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or_default()
    }
}

/// Partition of two record sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Present only in source
    pub added: Vec<Record>,
    /// Same id, at least one compared field differs
    pub modified: Vec<ModifiedEntry>,
    /// Present only in target
    pub deleted: Vec<Record>,
    pub unchanged: Vec<Record>,
    /// Invalid or repeated entries ignored across both sets
    pub skipped: usize,
    /// Ids left out of every partition because an entry for them was invalid
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quarantined: Vec<RecordId>,
}

/// Partition sizes of a [`DiffResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted + self.unchanged
    }
}

impl DiffResult {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            added: self.added.len(),
            modified: self.modified.len(),
            deleted: self.deleted.len(),
            unchanged: self.unchanged.len(),
        }
    }

    /// Whether applying this diff would change anything.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }
}

/// Computes diffs with a fixed set of options.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    options: DiffOptions,
}

impl DiffEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Partition `source` and `target` into added, modified, deleted and
    /// unchanged records.
    pub fn diff(&self, source: &RecordSet, target: &RecordSet) -> DiffResult {
        let mut result = DiffResult::default();

        // Quarantine ids of invalid entries on either side
        let mut quarantined: HashSet<&str> = HashSet::new();
        let rejected = source.quarantined().iter().chain(target.quarantined());
        let invalid = source
            .iter()
            .chain(target.iter())
            .filter(|r| !r.id.trim().is_empty() && r.validate().is_err())
            .map(|r| &r.id);
        for id in rejected.chain(invalid) {
            if quarantined.insert(id.as_str()) {
                result.quarantined.push(id.clone());
            }
        }
        let usable = |record: &Record| {
            !quarantined.contains(record.id.as_str()) && record.validate().is_ok()
        };

        // Index target by id
        let mut target_index: HashMap<&str, &Record> = HashMap::with_capacity(target.len());
        for record in target.iter() {
            if !usable(record) || target_index.contains_key(record.id.as_str()) {
                result.skipped += 1;
                continue;
            }
            target_index.insert(record.id.as_str(), record);
        }

        let mut source_ids: HashSet<&str> = HashSet::with_capacity(source.len());
        for record in source.iter() {
            if !usable(record) || !source_ids.insert(record.id.as_str()) {
                result.skipped += 1;
                continue;
            }

            match target_index.get(record.id.as_str()) {
                None => result.added.push(record.clone()),
                Some(existing) => {
                    let changes = self.compare(record, existing);
                    if changes.is_empty() {
                        result.unchanged.push(record.clone());
                    } else {
                        result.modified.push(ModifiedEntry {
                            id: record.id.clone(),
                            source: record.clone(),
                            target: (*existing).clone(),
                            changes,
                        });
                    }
                }
            }
        }

        // Deleted: indexed target records the source never mentioned.
        for record in target.iter() {
            let id = record.id.as_str();
            let indexed = target_index
                .get(id)
                .is_some_and(|r| std::ptr::eq(*r, record));
            if indexed && !source_ids.contains(id) {
                result.deleted.push(record.clone());
            }
        }

        result
    }

    /// Compare the configured fields of two records.
    pub fn compare(&self, source: &Record, target: &Record) -> Vec<FieldChange> {
        self.options
            .compare_fields
            .iter()
            .filter(|field| field.as_str() != fields::ID)
            .filter_map(|field| {
                let to = source.field(field);
                let from = target.field(field);
                if self.values_equal(&to, &from) {
                    return None;
                }
                let change_type = match (&from, &to) {
                    (Value::Null, _) => ChangeType::Added,
                    (_, Value::Null) => ChangeType::Removed,
                    _ => ChangeType::Updated,
                };
                let severity = field_severity(field, &from, &to);
                Some(FieldChange {
                    field: field.clone(),
                    from,
                    to,
                    change_type,
                    severity,
                })
            })
            .collect()
    }

    /// Type-aware equality. Mismatched types are never equal.
    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::String(x), Value::String(y)) => {
                x == y || (!self.options.case_sensitive && x.to_lowercase() == y.to_lowercase())
            }
            (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= self.options.numeric_tolerance,
                _ => false,
            },
            (Value::Array(xs), Value::Array(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| self.values_equal(x, y))
            }
            _ => a == b,
        }
    }
}

/// Severity of a field change, by field.
pub fn field_severity(field: &str, from: &Value, to: &Value) -> Severity {
    match field {
        fields::PROGRESS => match (from.as_f64(), to.as_f64()) {
            (Some(a), Some(b)) => progress_severity((a - b).abs()),
            _ => Severity::Medium,
        },
        fields::TITLE | fields::AUTHORS => Severity::High,
        fields::LAST_UPDATED | fields::TAGS => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Severity for a progress delta in percentage points.
pub fn progress_severity(delta: f64) -> Severity {
    if delta >= PROGRESS_HIGH_DELTA {
        Severity::High
    } else if delta >= PROGRESS_MEDIUM_DELTA {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Diff with the given options.
pub fn diff(source: &RecordSet, target: &RecordSet, options: &DiffOptions) -> DiffResult {
    DiffEngine::new(options.clone()).diff(source, target)
}
