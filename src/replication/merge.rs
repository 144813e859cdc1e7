//! Last-write-wins reconciliation of record collections.
//!
//! Merging is per collection, commutative and idempotent: the surviving
//! record for an id is always the one with the greatest `updatedAt`, and on
//! a tie the record already held locally is kept. Collections are treated as
//! unordered sets keyed by id; callers must not rely on output order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A replicated business entity.
///
/// Only `id` and `updatedAt` matter to replication. Every other field is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Records without a timestamp (absent or null) deserialize as the Unix epoch.
    #[serde(rename = "updatedAt", default, deserialize_with = "timestamp_or_epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether `self` should replace `existing` under last-write-wins.
    fn supersedes(&self, existing: &Record) -> bool {
        self.updated_at > existing.updated_at
    }
}

fn timestamp_or_epoch<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DateTime<Utc>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Named collections, i.e. a full snapshot as sent in `DATA_UPDATE`.
pub type Snapshot = BTreeMap<String, Vec<Record>>;

/// Counts of what a merge did to the local collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub replaced: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Reconcile `incoming` against `local` and return the merged collection.
pub fn merge_collection(local: &[Record], incoming: &[Record]) -> Vec<Record> {
    let mut by_id: BTreeMap<&str, &Record> =
        local.iter().map(|record| (record.id.as_str(), record)).collect();

    for record in incoming {
        match by_id.get(record.id.as_str()) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                by_id.insert(record.id.as_str(), record);
            }
        }
    }

    by_id.into_values().cloned().collect()
}

/// In-place variant of [`merge_collection`] that reports whether anything changed.
pub fn merge_into(local: &mut Vec<Record>, incoming: &[Record]) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut by_id: BTreeMap<String, Record> = local
        .drain(..)
        .map(|record| (record.id.clone(), record))
        .collect();

    for record in incoming {
        match by_id.get_mut(&record.id) {
            Some(existing) => {
                if record.supersedes(existing) {
                    *existing = record.clone();
                    outcome.replaced += 1;
                }
            }
            None => {
                by_id.insert(record.id.clone(), record.clone());
                outcome.inserted += 1;
            }
        }
    }

    local.extend(by_id.into_values());
    outcome
}
