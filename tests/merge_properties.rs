//! Property-based tests for last-write-wins reconciliation.
//!
//! Record content is derived from (id, timestamp), so two records with the
//! same id and timestamp are identical. That makes final state comparable
//! across merge orders even when ties occur.

use chrono::{DateTime, Duration, TimeZone, Utc};
use meshsync::replication::{merge_collection, Dataset, Record, Snapshot};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn ts(offset: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset as i64)
}

fn record(id: u8, offset: u32) -> Record {
    Record::new(format!("r{}", id), ts(offset)).with_field("v", format!("{}@{}", id, offset))
}

fn to_records(batch: &BTreeMap<u8, u32>) -> Vec<Record> {
    batch.iter().map(|(id, offset)| record(*id, *offset)).collect()
}

/// One collection: unique ids, small id space so batches overlap.
fn batch() -> impl Strategy<Value = BTreeMap<u8, u32>> {
    proptest::collection::btree_map(0u8..12, 0u32..40, 0..10)
}

fn by_id(records: &[Record]) -> BTreeMap<String, Record> {
    records.iter().map(|r| (r.id.clone(), r.clone())).collect()
}

// =============================================================================
// Core merge properties
// =============================================================================

proptest! {
    /// merge(merge(A, B), B) == merge(A, B)
    #[test]
    fn merge_is_idempotent(a in batch(), b in batch()) {
        let (a, b) = (to_records(&a), to_records(&b));
        let once = merge_collection(&a, &b);
        let twice = merge_collection(&once, &b);
        prop_assert_eq!(by_id(&once), by_id(&twice));
    }

    /// Equal timestamps keep the local record, whatever the incoming content.
    #[test]
    fn ties_keep_local(id in 0u8..12, offset in 0u32..40, other in "[a-z]{1,8}") {
        let local = vec![record(id, offset)];
        let incoming = vec![Record::new(format!("r{}", id), ts(offset)).with_field("v", other)];

        let merged = merge_collection(&local, &incoming);
        prop_assert_eq!(merged, local);
    }

    /// Every id ends up with the maximum timestamp seen for it.
    #[test]
    fn merge_resolves_to_newest(a in batch(), b in batch()) {
        let merged = by_id(&merge_collection(&to_records(&a), &to_records(&b)));

        let mut expected: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for (id, offset) in a.iter().chain(b.iter()) {
            let entry = expected.entry(format!("r{}", id)).or_insert(ts(*offset));
            if ts(*offset) > *entry {
                *entry = ts(*offset);
            }
        }

        prop_assert_eq!(merged.len(), expected.len());
        for (id, newest) in expected {
            prop_assert_eq!(merged[&id].updated_at, newest);
        }
    }

    /// Any permutation of the same merges yields the same per-id state.
    #[test]
    fn merge_order_does_not_matter(
        (batches, shuffled) in proptest::collection::vec(batch(), 1..6)
            .prop_flat_map(|b| (Just(b.clone()), Just(b).prop_shuffle()))
    ) {
        let fold = |batches: &[BTreeMap<u8, u32>]| {
            batches
                .iter()
                .fold(Vec::new(), |acc, b| merge_collection(&acc, &to_records(b)))
        };

        prop_assert_eq!(by_id(&fold(&batches)), by_id(&fold(&shuffled)));
    }

    /// Stale records never overwrite newer local ones.
    #[test]
    fn stale_incoming_ignored(id in 0u8..12, newer in 10u32..40, older in 0u32..10) {
        let local = vec![record(id, newer)];
        let merged = merge_collection(&local, &[record(id, older)]);
        prop_assert_eq!(merged, local);
    }
}

// =============================================================================
// Dataset-level convergence
// =============================================================================

proptest! {
    /// Two replicas exchanging snapshots in either order end up identical,
    /// and a second exchange changes nothing (relaying stops).
    #[test]
    fn replicas_converge_after_exchange(
        clients_a in batch(),
        clients_b in batch(),
        brokers_b in batch(),
    ) {
        let mut snap_a = Snapshot::new();
        snap_a.insert("clients".into(), to_records(&clients_a));
        let mut snap_b = Snapshot::new();
        snap_b.insert("clients".into(), to_records(&clients_b));
        snap_b.insert("brokers".into(), to_records(&brokers_b));

        let mut a = Dataset::from_snapshot(snap_a.clone());
        let mut b = Dataset::from_snapshot(snap_b.clone());

        a.merge_snapshot(&snap_b);
        b.merge_snapshot(&snap_a);

        for name in ["clients", "brokers"] {
            prop_assert_eq!(by_id(a.collection(name)), by_id(b.collection(name)));
        }

        let again = a.merge_snapshot(&b.snapshot());
        prop_assert!(again.is_empty());
    }
}
