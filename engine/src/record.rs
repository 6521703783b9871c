//! Record types describing a book as captured from one platform.

use crate::{error::Result, Error, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Field names with a typed home on [`Record`].
pub mod fields {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const PROGRESS: &str = "progress";
    pub const LAST_UPDATED: &str = "lastUpdated";
    pub const AUTHORS: &str = "authors";
    pub const TAGS: &str = "tags";
}

/// An immutable snapshot of one book.
///
/// Fields the engine does not model explicitly are kept in `extra` so they
/// can still take part in a diff when named in `compareFields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable identifier shared across platforms
    pub id: RecordId,
    /// Book title
    #[serde(default)]
    pub title: String,
    /// Reading progress in percent (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Last update time on the capturing platform (milliseconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Any other captured fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Create a record with only an id and a title.
    pub fn new(id: impl Into<RecordId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            progress: None,
            last_updated: None,
            authors: Vec::new(),
            tags: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Builder-style setter for progress.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builder-style setter for the last update timestamp.
    pub fn with_last_updated(mut self, timestamp: Timestamp) -> Self {
        self.last_updated = Some(timestamp);
        self
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style setter for an untyped extra field.
    pub fn with_extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Check the record is usable for reconciliation.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("missing id".into()));
        }
        if let Some(progress) = self.progress {
            if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
                return Err(Error::InvalidRecord(format!(
                    "progress {progress} out of range for '{}'",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Read a field by its camelCase name. Absent fields read as `Null`.
    pub fn field(&self, name: &str) -> Value {
        match name {
            fields::ID => Value::String(self.id.clone()),
            fields::TITLE => Value::String(self.title.clone()),
            fields::PROGRESS => self.progress.map_or(Value::Null, number),
            fields::LAST_UPDATED => self
                .last_updated
                .map_or(Value::Null, |ts| Value::Number(ts.into())),
            fields::AUTHORS => string_array(&self.authors),
            fields::TAGS => string_array(&self.tags),
            other => self.extra.get(other).cloned().unwrap_or(Value::Null),
        }
    }

    /// Produce a new snapshot with one field replaced.
    ///
    /// Typed fields only accept values of their own type.
    pub fn set_field(&self, name: &str, value: Value) -> Result<Record> {
        let mut next = self.clone();
        let mismatch = || Error::InvalidRecord(format!("cannot assign {value} to '{name}'"));
        match name {
            fields::ID => return Err(Error::InvalidRecord("id is immutable".into())),
            fields::TITLE => next.title = value.as_str().ok_or_else(mismatch)?.to_string(),
            fields::PROGRESS => {
                next.progress = match &value {
                    Value::Null => None,
                    v => Some(v.as_f64().ok_or_else(mismatch)?),
                }
            }
            fields::LAST_UPDATED => {
                next.last_updated = match &value {
                    Value::Null => None,
                    v => Some(v.as_u64().ok_or_else(mismatch)?),
                }
            }
            fields::AUTHORS => next.authors = strings_from(&value).ok_or_else(mismatch)?,
            fields::TAGS => next.tags = strings_from(&value).ok_or_else(mismatch)?,
            other => {
                next.extra.insert(other.to_string(), value);
            }
        }
        next.validate()?;
        Ok(next)
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn strings_from(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Records captured from one platform at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSet {
    records: Vec<Record>,
    /// Entries dropped while building the set
    #[serde(default, skip_serializing_if = "is_zero")]
    rejected: usize,
    /// Ids of dropped entries that still carried a usable id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    quarantined: Vec<RecordId>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl RecordSet {
    /// Wrap records as-is. Validation is deferred to the diff.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            rejected: 0,
            quarantined: Vec::new(),
        }
    }

    /// Build a set, failing on invalid records or duplicate ids.
    pub fn try_from_records(records: Vec<Record>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            record.validate()?;
            if !seen.insert(record.id.as_str()) {
                return Err(Error::DuplicateRecord(record.id.clone()));
            }
        }
        Ok(Self::new(records))
    }

    /// Build a set from raw captured JSON, skipping entries that do not
    /// deserialize or fail validation.
    ///
    /// A skipped entry that still names an id is quarantined: the diff keeps
    /// that id out of every partition instead of treating it as absent.
    pub fn from_json_values(values: Vec<Value>) -> Self {
        let mut set = Self::default();
        for value in values {
            let id = value
                .get(fields::ID)
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string);
            match serde_json::from_value::<Record>(value) {
                Ok(record) if record.validate().is_ok() => set.records.push(record),
                _ => {
                    set.rejected += 1;
                    set.quarantined.extend(id);
                }
            }
        }
        set
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Get a record by id (first occurrence).
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of raw entries dropped by [`RecordSet::from_json_values`].
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Ids whose captured entry was dropped.
    pub fn quarantined(&self) -> &[RecordId] {
        &self.quarantined
    }

    /// Move the records out, leaving the rejection bookkeeping behind.
    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }

    /// Merge another set into this one. Ids already present are kept.
    pub fn merge(&mut self, other: RecordSet) {
        let mut seen: HashSet<RecordId> = self.records.iter().map(|r| r.id.clone()).collect();
        self.rejected += other.rejected;
        self.quarantined.extend(other.quarantined);
        for record in other.records {
            if seen.insert(record.id.clone()) {
                self.records.push(record);
            }
        }
    }
}

impl From<Vec<Record>> for RecordSet {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_access() {
        let record = Record::new("b1", "Dune")
            .with_progress(42.5)
            .with_last_updated(1000)
            .with_authors(["Frank Herbert"])
            .with_extra("publisher", json!("Chilton"));

        assert_eq!(record.field("id"), json!("b1"));
        assert_eq!(record.field("title"), json!("Dune"));
        assert_eq!(record.field("progress"), json!(42.5));
        assert_eq!(record.field("lastUpdated"), json!(1000));
        assert_eq!(record.field("authors"), json!(["Frank Herbert"]));
        assert_eq!(record.field("tags"), json!([]));
        assert_eq!(record.field("publisher"), json!("Chilton"));
        assert_eq!(record.field("isbn"), Value::Null);
    }

    #[test]
    fn set_field_returns_new_snapshot() {
        let record = Record::new("b1", "Dune").with_progress(10.0);
        let patched = record.set_field("progress", json!(70)).unwrap();

        assert_eq!(record.progress, Some(10.0));
        assert_eq!(patched.progress, Some(70.0));
    }

    #[test]
    fn set_field_rejects_wrong_type() {
        let record = Record::new("b1", "Dune");
        assert!(record.set_field("title", json!(3)).is_err());
        assert!(record.set_field("id", json!("b2")).is_err());
        assert!(record.set_field("progress", json!(120)).is_err());
    }

    #[test]
    fn validate_rejects_missing_id_and_bad_progress() {
        assert!(Record::new("", "x").validate().is_err());
        assert!(Record::new("  ", "x").validate().is_err());
        assert!(Record::new("b1", "x").with_progress(-1.0).validate().is_err());
        assert!(Record::new("b1", "x").with_progress(100.0).validate().is_ok());
    }

    #[test]
    fn from_json_values_skips_invalid_entries() {
        let set = RecordSet::from_json_values(vec![
            json!({"id": "b1", "title": "Foo", "progress": 40}),
            json!({"title": "no id"}),
            json!({"id": "", "title": "empty id"}),
            json!({"id": "b2", "progress": 300}),
            json!("not an object"),
        ]);

        assert_eq!(set.len(), 1);
        assert_eq!(set.rejected(), 4);
        assert_eq!(set.get("b1").unwrap().progress, Some(40.0));
        assert_eq!(set.quarantined(), ["b2".to_string()]);
    }

    #[test]
    fn unparseable_entry_with_id_is_quarantined() {
        let mut set = RecordSet::from_json_values(vec![
            json!({"id": "b1", "title": "Foo", "lastUpdated": "2024-05-01T10:00:00Z"}),
            json!({"id": "b2", "title": "Bar"}),
        ]);
        assert_eq!(set.quarantined(), ["b1".to_string()]);

        let records = set.take_records();
        assert_eq!(records.len(), 1);
        assert!(set.is_empty());
        assert_eq!(set.rejected(), 1);

        let mut merged = RecordSet::new(records);
        merged.merge(set);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.quarantined(), ["b1".to_string()]);
    }

    #[test]
    fn try_from_records_rejects_duplicates() {
        let err = RecordSet::try_from_records(vec![Record::new("b1", "a"), Record::new("b1", "b")])
            .unwrap_err();
        assert_eq!(err, Error::DuplicateRecord("b1".into()));
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        let mut left = RecordSet::new(vec![Record::new("b1", "left")]);
        left.merge(RecordSet::new(vec![
            Record::new("b1", "right"),
            Record::new("b2", "other"),
        ]));

        assert_eq!(left.len(), 2);
        assert_eq!(left.get("b1").unwrap().title, "left");
    }

    #[test]
    fn serialization_format() {
        let record = Record::new("b1", "Foo")
            .with_progress(40.0)
            .with_last_updated(1706745600000);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("lastUpdated")); // camelCase
        assert!(!json.contains("authors")); // empty lists omitted

        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
