//! Stats engine metrics.
//!
//! Recorded through the `metrics` facade; the host process installs the
//! recorder/exporter. These complement the structured log events that carry
//! the same names in their `metric` field.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Reconciliation
// ============================================================================

/// Records persisted by the reconciliation writer.
pub const RECONCILE_WRITES: &str = "vitals_reconcile_writes_total";

/// Records deleted by the reconciliation writer.
pub const RECONCILE_DELETES: &str = "vitals_reconcile_deletes_total";

/// Failed reconciliation work items.
pub const RECONCILE_ERRORS: &str = "vitals_reconcile_errors_total";

/// Reconciliation run duration histogram.
pub const RECONCILE_DURATION: &str = "vitals_reconcile_duration_seconds";

// ============================================================================
// Population / ingestion
// ============================================================================

/// Populate calls served from the cache.
pub const CACHE_HITS: &str = "vitals_stats_cache_hits_total";

/// Cache lookups that found no servable entry.
pub const CACHE_MISSES: &str = "vitals_stats_cache_misses_total";

/// Events accepted by ingestion.
pub const EVENTS_INGESTED: &str = "vitals_events_ingested_total";

/// Registers all metric descriptions.
///
/// Call once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(RECONCILE_WRITES, "Records written by reconciliation");
    describe_counter!(RECONCILE_DELETES, "Records deleted by reconciliation");
    describe_counter!(RECONCILE_ERRORS, "Reconciliation work items that failed");
    describe_histogram!(RECONCILE_DURATION, "Duration of reconciliation runs in seconds");
    describe_counter!(CACHE_HITS, "Stats populations served from cache");
    describe_counter!(CACHE_MISSES, "Stats cache lookups that found no servable entry");
    describe_counter!(EVENTS_INGESTED, "Events accepted by ingestion");
}

/// Records a completed reconciliation run.
pub fn record_reconcile_completion(writes: u64, deletes: u64, errors: u64, duration_secs: f64) {
    counter!(RECONCILE_WRITES).increment(writes);
    counter!(RECONCILE_DELETES).increment(deletes);
    counter!(RECONCILE_ERRORS).increment(errors);
    histogram!(RECONCILE_DURATION).record(duration_secs);
}

/// Records the outcome of a cache lookup during population.
pub fn record_cache_lookup(hit: bool) {
    if hit {
        counter!(CACHE_HITS).increment(1);
    } else {
        counter!(CACHE_MISSES).increment(1);
    }
}

/// Records an ingested event.
pub fn record_ingested(kind: &str) {
    counter!(EVENTS_INGESTED, "kind" => kind.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        register_metrics();
        record_reconcile_completion(3, 1, 0, 0.25);
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_ingested("commit");
    }
}
