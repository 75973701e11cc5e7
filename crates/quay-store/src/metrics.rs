//! Store metrics.
//!
//! Counters for the sync protocol, the document mirror and reconciliation.
//! They complement the structured logs emitted by the same code paths.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Sync Metrics
// ============================================================================

/// Batches committed to the relational store.
pub const SYNC_BATCHES_COMMITTED: &str = "quay_sync_batches_committed_total";

/// Batches whose relational transaction failed.
pub const SYNC_BATCHES_FAILED: &str = "quay_sync_batches_failed_total";

/// Records applied by committed batches.
pub const SYNC_RECORDS_UPSERTED: &str = "quay_sync_records_upserted_total";

/// Sync requests rejected before any write.
pub const SYNC_REJECTED: &str = "quay_sync_rejected_total";

/// Duration of a single batch transaction.
pub const SYNC_BATCH_DURATION: &str = "quay_sync_batch_duration_seconds";

// ============================================================================
// Mirror Metrics
// ============================================================================

/// Document-store writes by outcome.
pub const MIRROR_WRITES: &str = "quay_mirror_writes_total";

/// Document-store writes that failed.
pub const MIRROR_FAILURES: &str = "quay_mirror_failures_total";

/// CAS retry counter.
pub const CAS_RETRY: &str = "quay_cas_retry_total";

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Drift issues found by reconciliation.
pub const RECONCILE_ISSUES: &str = "quay_reconcile_issues_total";

/// Registers all store metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(SYNC_BATCHES_COMMITTED, "Total sync batches committed");
    describe_counter!(SYNC_BATCHES_FAILED, "Total sync batches rolled back");
    describe_counter!(SYNC_RECORDS_UPSERTED, "Total records applied by sync batches");
    describe_counter!(SYNC_REJECTED, "Total sync requests rejected before writing");
    describe_histogram!(SYNC_BATCH_DURATION, "Duration of sync batch transactions in seconds");
    describe_counter!(MIRROR_WRITES, "Total document store writes");
    describe_counter!(MIRROR_FAILURES, "Total failed document store writes");
    describe_counter!(CAS_RETRY, "Total CAS retry attempts");
    describe_counter!(RECONCILE_ISSUES, "Total drift issues found by reconciliation");
}

/// Records a committed sync batch.
pub fn record_batch_committed(entity: &str, records: usize, duration_secs: f64) {
    let labels = [("entity", entity.to_string())];

    counter!(SYNC_BATCHES_COMMITTED, &labels).increment(1);
    counter!(SYNC_RECORDS_UPSERTED, &labels).increment(records as u64);
    histogram!(SYNC_BATCH_DURATION, &labels).record(duration_secs);
}

/// Records a failed sync batch.
pub fn record_batch_failed(entity: &str) {
    counter!(SYNC_BATCHES_FAILED, "entity" => entity.to_string()).increment(1);
}

/// Records a sync request rejected during validation.
pub fn record_sync_rejected(reason: &'static str) {
    counter!(SYNC_REJECTED, "reason" => reason).increment(1);
}

/// Records a document-store write.
pub fn record_mirror_write(collection: &str, outcome: &'static str) {
    counter!(
        MIRROR_WRITES,
        "collection" => collection.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Records a failed document-store write.
pub fn record_mirror_failure(collection: &str) {
    counter!(MIRROR_FAILURES, "collection" => collection.to_string()).increment(1);
}

/// Records a CAS retry attempt.
pub fn record_cas_retry(operation: &str) {
    counter!(CAS_RETRY, "operation" => operation.to_string()).increment(1);
}

/// Records drift found by a reconciliation check.
pub fn record_reconcile_issues(collection: &str, issues: usize) {
    counter!(RECONCILE_ISSUES, "collection" => collection.to_string()).increment(issues as u64);
}
