//! Merge-policy planning.
//!
//! Turns a diff plus the outcome of conflict handling into the change set
//! a target platform should apply. Planning is pure; applying the plan is
//! the sink's job.

use crate::{DiffResult, Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Which diff categories get applied to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePolicy {
    /// Apply added, modified and deleted (default)
    #[default]
    Merge,
    /// Force-apply everything, including over unresolved target data
    Overwrite,
    /// Apply added records only
    Append,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MergePolicy::Merge => "MERGE",
            MergePolicy::Overwrite => "OVERWRITE",
            MergePolicy::Append => "APPEND",
        })
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(MergePolicy::Merge),
            "overwrite" => Ok(MergePolicy::Overwrite),
            "append" => Ok(MergePolicy::Append),
            other => Err(format!("unknown merge policy: {other}")),
        }
    }
}

/// Diff category a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeCategory {
    Added,
    Modified,
    Deleted,
}

/// Changes to write to one target platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Records to create
    pub added: Vec<Record>,
    /// Records to replace, already patched with resolved values
    pub modified: Vec<Record>,
    /// Ids to remove
    pub deleted: Vec<RecordId>,
    /// Target records as they were before this change set, for rollback
    pub previous: Vec<Record>,
    /// Apply even when the sink would otherwise refuse
    pub force: bool,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change set that undoes this one.
    ///
    /// Added records are deleted again, modified records get their previous
    /// value back and deleted records are re-created.
    pub fn inverse(&self) -> ChangeSet {
        let previous: HashMap<&str, &Record> =
            self.previous.iter().map(|r| (r.id.as_str(), r)).collect();

        let modified = self
            .modified
            .iter()
            .filter_map(|r| previous.get(r.id.as_str()).map(|p| (*p).clone()))
            .collect();
        let added = self
            .deleted
            .iter()
            .filter_map(|id| previous.get(id.as_str()).map(|p| (*p).clone()))
            .collect();

        ChangeSet {
            added,
            modified,
            deleted: self.added.iter().map(|r| r.id.clone()).collect(),
            previous: Vec::new(),
            force: true,
        }
    }
}

/// What a sink reports after applying a change set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

impl ApplyResult {
    pub fn applied(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A change the policy chose not to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChange {
    pub record_id: RecordId,
    pub category: ChangeCategory,
    pub reason: String,
}

impl SkippedChange {
    fn new(record_id: &str, category: ChangeCategory, reason: impl Into<String>) -> Self {
        Self {
            record_id: record_id.to_string(),
            category,
            reason: reason.into(),
        }
    }
}

/// Result of planning a target's changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlan {
    pub change_set: ChangeSet,
    pub skipped: Vec<SkippedChange>,
    pub warnings: Vec<String>,
}

/// Plan the changes for one target.
///
/// `overrides` holds modified records already patched with resolved
/// values; other modified records take the source version. `withheld`
/// lists records with conflicts awaiting manual review. `MERGE` leaves
/// them untouched, `OVERWRITE` writes the source version anyway.
pub fn plan_changes(
    diff: &DiffResult,
    overrides: &HashMap<RecordId, Record>,
    withheld: &HashSet<RecordId>,
    policy: MergePolicy,
) -> ChangePlan {
    let mut plan = ChangePlan::default();
    plan.change_set.added = diff.added.clone();

    if policy == MergePolicy::Append {
        for entry in &diff.modified {
            plan.skipped.push(SkippedChange::new(
                &entry.id,
                ChangeCategory::Modified,
                "APPEND policy applies added records only",
            ));
        }
        for record in &diff.deleted {
            plan.skipped.push(SkippedChange::new(
                &record.id,
                ChangeCategory::Deleted,
                "APPEND policy applies added records only",
            ));
        }
        return plan;
    }

    let force = policy == MergePolicy::Overwrite;
    let mut overwritten = 0;

    for entry in &diff.modified {
        if withheld.contains(&entry.id) {
            if !force {
                plan.skipped.push(SkippedChange::new(
                    &entry.id,
                    ChangeCategory::Modified,
                    "unresolved conflict awaiting manual review",
                ));
                continue;
            }
            overwritten += 1;
        }
        let record = overrides
            .get(&entry.id)
            .cloned()
            .unwrap_or_else(|| entry.source.clone());
        plan.change_set.modified.push(record);
        plan.change_set.previous.push(entry.target.clone());
    }

    for record in &diff.deleted {
        plan.change_set.deleted.push(record.id.clone());
        plan.change_set.previous.push(record.clone());
    }

    if force {
        plan.change_set.force = true;
        let replaced = plan.change_set.modified.len() + plan.change_set.deleted.len();
        if replaced > 0 {
            plan.warnings.push(format!(
                "OVERWRITE replaces {} modified and deletes {} target records; \
                 target-only data will be lost ({} with unresolved conflicts)",
                plan.change_set.modified.len(),
                plan.change_set.deleted.len(),
                overwritten,
            ));
        }
    }

    plan
}
