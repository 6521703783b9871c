//! In-memory platform.
//!
//! Implements both collaborator traits over a map of libraries. Used by the
//! CLI and as the test double for orchestrator tests, so it can also script
//! failures and delays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use shelf_engine::{ApplyResult, ChangeSet, MergePolicy, PlatformId, Record, RecordSet};

use crate::platform::{PlatformError, RecordSink, RecordSource};

/// Callback invoked after every successful apply, with the platform id.
pub type ApplyHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Libraries keyed by platform id.
#[derive(Default)]
pub struct InMemoryPlatform {
    libraries: DashMap<PlatformId, Vec<Record>>,
    /// Entries of an inserted capture that could not be read as records
    residue: DashMap<PlatformId, RecordSet>,
    /// Errors returned by upcoming fetches, consumed in order
    fetch_failures: DashMap<PlatformId, VecDeque<String>>,
    /// Error returned by every apply to the platform
    apply_failures: DashMap<PlatformId, String>,
    fetch_delay: Duration,
    apply_delay: Duration,
    on_apply: Option<ApplyHook>,
    applies: AtomicUsize,
}

impl std::fmt::Debug for InMemoryPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPlatform")
            .field("platforms", &self.libraries.len())
            .field("fetch_delay", &self.fetch_delay)
            .field("apply_delay", &self.apply_delay)
            .finish()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `delay`.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Delay every apply by `delay`.
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Run `hook` after each successful apply.
    pub fn on_apply(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_apply = Some(Arc::new(hook));
        self
    }

    /// Replace a platform's library.
    pub fn insert_library(&self, platform: impl Into<PlatformId>, records: Vec<Record>) {
        let platform = platform.into();
        self.residue.remove(&platform);
        self.libraries.insert(platform, records);
    }

    /// Replace a platform's library with a parsed capture. Rejected and
    /// quarantined entries are reported again by every fetch.
    pub fn insert_capture(&self, platform: impl Into<PlatformId>, mut capture: RecordSet) {
        let platform = platform.into();
        self.libraries.insert(platform.clone(), capture.take_records());
        if capture.rejected() > 0 {
            self.residue.insert(platform, capture);
        } else {
            self.residue.remove(&platform);
        }
    }

    /// Current library of a platform, empty when unknown.
    pub fn records(&self, platform: &str) -> Vec<Record> {
        self.libraries
            .get(platform)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn record(&self, platform: &str, id: &str) -> Option<Record> {
        self.libraries
            .get(platform)?
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Make the next fetch from `platform` fail with `message`.
    pub fn fail_next_fetch(&self, platform: impl Into<PlatformId>, message: impl Into<String>) {
        self.fetch_failures
            .entry(platform.into())
            .or_default()
            .push_back(message.into());
    }

    /// Make every apply to `platform` fail with `message`.
    pub fn fail_applies(&self, platform: impl Into<PlatformId>, message: impl Into<String>) {
        self.apply_failures.insert(platform.into(), message.into());
    }

    /// Number of successful applies, rollbacks included.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::Relaxed)
    }

    fn next_fetch_failure(&self, platform: &str) -> Option<String> {
        self.fetch_failures.get_mut(platform)?.pop_front()
    }

    fn write(&self, platform: &str, changes: &ChangeSet) -> ApplyResult {
        let mut result = ApplyResult::default();
        let mut library = self.libraries.entry(platform.to_string()).or_default();

        for record in &changes.added {
            match library.iter().position(|r| r.id == record.id) {
                None => {
                    library.push(record.clone());
                    result.added += 1;
                }
                Some(index) if changes.force => {
                    library[index] = record.clone();
                    result.added += 1;
                }
                Some(_) => result
                    .errors
                    .push(format!("record {} already exists", record.id)),
            }
        }

        for record in &changes.modified {
            match library.iter().position(|r| r.id == record.id) {
                Some(index) => {
                    library[index] = record.clone();
                    result.modified += 1;
                }
                None if changes.force => {
                    library.push(record.clone());
                    result.modified += 1;
                }
                None => result
                    .errors
                    .push(format!("record {} not found", record.id)),
            }
        }

        for id in &changes.deleted {
            match library.iter().position(|r| &r.id == id) {
                Some(index) => {
                    library.remove(index);
                    result.deleted += 1;
                }
                None if changes.force => {}
                None => result.errors.push(format!("record {id} not found")),
            }
        }

        result
    }
}

#[async_trait]
impl RecordSource for InMemoryPlatform {
    async fn fetch_records(&self, platform: &str) -> Result<RecordSet, PlatformError> {
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if let Some(message) = self.next_fetch_failure(platform) {
            return Err(PlatformError::new(platform, message));
        }
        let mut set = RecordSet::new(self.records(platform));
        if let Some(residue) = self.residue.get(platform) {
            set.merge(residue.value().clone());
        }
        Ok(set)
    }
}

#[async_trait]
impl RecordSink for InMemoryPlatform {
    async fn apply_change(
        &self,
        platform: &str,
        changes: &ChangeSet,
        policy: MergePolicy,
    ) -> Result<ApplyResult, PlatformError> {
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        if let Some(message) = self.apply_failures.get(platform) {
            return Err(PlatformError::new(platform, message.value().clone()));
        }

        let result = self.write(platform, changes);
        self.applies.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            platform = %platform,
            policy = %policy,
            added = result.added,
            modified = result.modified,
            deleted = result.deleted,
            errors = result.errors.len(),
            "Applied change set"
        );

        if let Some(hook) = &self.on_apply {
            hook(platform);
        }
        Ok(result)
    }
}
