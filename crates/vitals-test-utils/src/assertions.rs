//! Custom assertion helpers for integration tests.

use vitals_core::{Kind, RecordKey};
use vitals_stats::{Countable, Project, ReconcileSummary};

use crate::storage::{OpKind, StoreOp, TracingEventStore};

/// Asserts that no store reads were recorded.
///
/// # Panics
///
/// Panics if any get, query or count was recorded.
pub fn assert_no_store_reads(store: &TracingEventStore) {
    let reads: Vec<StoreOp> = store
        .operations()
        .into_iter()
        .filter(|op| matches!(op.op(), OpKind::Get | OpKind::Query | OpKind::Count))
        .collect();
    assert!(reads.is_empty(), "Expected no store reads, got {reads:?}");
}

/// Asserts that no writes or deletes were recorded.
///
/// # Panics
///
/// Panics if any mutation was recorded.
pub fn assert_no_mutations(store: &TracingEventStore) {
    let mutations = store.mutations();
    assert!(
        mutations.is_empty(),
        "Expected no store mutations, got {mutations:?}"
    );
}

/// Asserts that `key` was deleted.
///
/// # Panics
///
/// Panics if no delete of `key` was recorded.
pub fn assert_deleted(store: &TracingEventStore, key: &RecordKey) {
    let deleted = store
        .operations()
        .contains(&StoreOp::Delete { key: key.clone() });
    assert!(deleted, "Expected {key} to be deleted");
}

/// Asserts that every event is marked counted.
///
/// # Panics
///
/// Panics on the first uncounted event.
pub fn assert_all_counted(events: &[Countable]) {
    for event in events {
        assert!(event.counted, "Event {} is not counted", event.key);
    }
}

/// Asserts that a reconciliation run had no item failures.
///
/// # Panics
///
/// Panics if the summary reports errors.
pub fn assert_clean_run(summary: &ReconcileSummary) {
    assert_eq!(
        summary.errors, 0,
        "Expected a clean run, first error: {:?}",
        summary.first_error
    );
}

/// Asserts that a project has derived stats and returns them.
///
/// # Panics
///
/// Panics if the project is unpopulated.
pub fn populated_stats(project: &Project) -> vitals_stats::DerivedStats {
    *project
        .stats()
        .unwrap_or_else(|| panic!("Expected project {} to be populated", project.id))
}

/// Asserts the number of stored records of `kind`.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_record_count(store: &TracingEventStore, kind: Kind, expected: usize) {
    let actual = store.len_of(kind);
    assert_eq!(
        actual, expected,
        "Expected {expected} {kind} record(s), found {actual}"
    );
}
