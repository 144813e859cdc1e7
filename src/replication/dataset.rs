use super::merge::{merge_collection, merge_into, Record, Snapshot};
use chrono::Utc;
use tracing::debug;

/// The local replica: every named collection held by this device.
///
/// All mutation goes through `&mut self` on the session actor, so a local
/// edit and a remote merge are always applied to the latest prior state.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    collections: Snapshot,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a persisted snapshot, dropping duplicate ids (newest wins).
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let collections = snapshot
            .into_iter()
            .map(|(name, records)| {
                let deduped = merge_collection(&[], &records);
                (name, deduped)
            })
            .collect();
        Self { collections }
    }

    /// Full copy of every collection, as broadcast in `DATA_UPDATE`.
    pub fn snapshot(&self) -> Snapshot {
        self.collections.clone()
    }

    pub fn collection(&self, name: &str) -> &[Record] {
        self.collections
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find(&self, collection: &str, id: &str) -> Option<&Record> {
        self.collection(collection).iter().find(|r| r.id == id)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(Vec::is_empty)
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// Merge every collection present in `payload`, independently.
    ///
    /// Returns the names of the collections that changed. There is no
    /// atomicity across collections.
    pub fn merge_snapshot(&mut self, payload: &Snapshot) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, incoming) in payload {
            let local = self.collections.entry(name.clone()).or_default();
            let outcome = merge_into(local, incoming);
            if outcome.changed() {
                debug!(
                    collection = %name,
                    inserted = outcome.inserted,
                    replaced = outcome.replaced,
                    "merged remote collection"
                );
                changed.push(name.clone());
            }
        }
        changed
    }

    /// Insert or replace a record by id, stamping `updatedAt` with the current time.
    pub fn upsert(&mut self, collection: &str, mut record: Record) -> Record {
        let now = Utc::now();
        // Keep the stamp strictly increasing per record even if the clock stalls.
        let previous = self.find(collection, &record.id).map(|r| r.updated_at);
        record.updated_at = match previous {
            Some(prev) if prev >= now => prev + chrono::Duration::milliseconds(1),
            _ => now,
        };

        let records = self.collections.entry(collection.to_string()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        record
    }

    /// Replace a whole collection. Duplicate ids collapse to the newest record.
    pub fn replace_collection(&mut self, collection: &str, records: Vec<Record>) {
        let deduped = merge_collection(&[], &records);
        self.collections.insert(collection.to_string(), deduped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_merge_snapshot_reports_changed_collections() {
        let mut dataset = Dataset::new();
        dataset.replace_collection("clients", vec![Record::new("c1", at(2))]);

        let mut payload = Snapshot::new();
        payload.insert("clients".into(), vec![Record::new("c1", at(1))]);
        payload.insert("brokers".into(), vec![Record::new("b1", at(1))]);

        let changed = dataset.merge_snapshot(&payload);
        assert_eq!(changed, vec!["brokers".to_string()]);
        assert_eq!(dataset.record_count(), 2);
        assert_eq!(dataset.find("clients", "c1").unwrap().updated_at, at(2));
    }

    #[test]
    fn test_upsert_stamps_and_replaces() {
        let mut dataset = Dataset::new();
        let first = dataset.upsert("clients", Record::new("c1", at(1)).with_field("n", 1));
        assert!(first.updated_at > at(1));

        let second = dataset.upsert("clients", Record::new("c1", at(1)).with_field("n", 2));
        assert!(second.updated_at > first.updated_at);
        assert_eq!(dataset.collection("clients").len(), 1);
        assert_eq!(
            dataset.find("clients", "c1").unwrap().field("n"),
            Some(&serde_json::Value::from(2))
        );
    }

    #[test]
    fn test_from_snapshot_dedupes() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "clients".into(),
            vec![Record::new("c1", at(1)), Record::new("c1", at(3))],
        );
        let dataset = Dataset::from_snapshot(snapshot);
        assert_eq!(dataset.collection("clients").len(), 1);
        assert_eq!(dataset.find("clients", "c1").unwrap().updated_at, at(3));
    }

    #[test]
    fn test_empty_dataset() {
        let dataset = Dataset::new();
        assert!(dataset.is_empty());
        assert!(dataset.collection("missing").is_empty());
    }
}
