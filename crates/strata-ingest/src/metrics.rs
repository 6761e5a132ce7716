//! Ingestion metrics.
//!
//! Counters and histograms for stage outcomes and commit contention. These
//! complement the structured logging emitted by each stage.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Stage Outcome Metrics
// ============================================================================

/// Records accepted into the target table.
pub const RECORDS_ACCEPTED: &str = "strata_records_accepted_total";

/// Records routed to quarantine.
pub const RECORDS_QUARANTINED: &str = "strata_records_quarantined_total";

/// Records dropped for a null primary key.
pub const RECORDS_DROPPED: &str = "strata_records_dropped_total";

/// Records kept with at least one field nulled by a failed cast.
pub const RECORDS_FLAGGED: &str = "strata_records_flagged_total";

/// Fields masked by the sanitization barrier.
pub const FIELDS_MASKED: &str = "strata_fields_masked_total";

// ============================================================================
// Commit Metrics
// ============================================================================

/// Commit attempts that lost an optimistic race and were retried.
pub const COMMIT_RETRIES: &str = "strata_commit_retries_total";

/// Writes that exhausted their retries.
pub const WRITE_CONFLICTS: &str = "strata_write_conflicts_total";

/// Stage invocations skipped because their replay signature was recorded.
pub const REPLAY_SKIPPED: &str = "strata_replay_skipped_total";

/// Merge duration histogram.
pub const MERGE_DURATION: &str = "strata_merge_duration_seconds";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all ingestion metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(RECORDS_ACCEPTED, "Total records accepted by a stage");
    describe_counter!(RECORDS_QUARANTINED, "Total records routed to quarantine");
    describe_counter!(RECORDS_DROPPED, "Total records dropped for a null primary key");
    describe_counter!(RECORDS_FLAGGED, "Total records kept with nulled cast failures");
    describe_counter!(FIELDS_MASKED, "Total fields masked by the sanitization barrier");
    describe_counter!(COMMIT_RETRIES, "Total optimistic commit retries");
    describe_counter!(WRITE_CONFLICTS, "Total writes that exhausted commit retries");
    describe_counter!(REPLAY_SKIPPED, "Total stage runs short-circuited by replay markers");
    describe_histogram!(MERGE_DURATION, "Duration of Silver merges in seconds");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records the row counts of a completed stage run.
pub fn record_stage_counts(
    stage: &str,
    accepted: usize,
    quarantined: usize,
    dropped: usize,
    flagged: usize,
) {
    let labels = [("stage", stage.to_string())];

    counter!(RECORDS_ACCEPTED, &labels).increment(as_u64(accepted));
    counter!(RECORDS_QUARANTINED, &labels).increment(as_u64(quarantined));
    counter!(RECORDS_DROPPED, &labels).increment(as_u64(dropped));
    counter!(RECORDS_FLAGGED, &labels).increment(as_u64(flagged));
}

/// Records a field masked by `rule`.
pub fn record_masked_field(rule: &str) {
    counter!(FIELDS_MASKED, "rule" => rule.to_string()).increment(1);
}

/// Records a commit retry against `table`.
pub fn record_commit_retry(table: &str) {
    counter!(COMMIT_RETRIES, "table" => table.to_string()).increment(1);
}

/// Records an exhausted write against `table`.
pub fn record_write_conflict(table: &str) {
    counter!(WRITE_CONFLICTS, "table" => table.to_string()).increment(1);
}

/// Records a replay short-circuit.
pub fn record_replay_skip(stage: &str) {
    counter!(REPLAY_SKIPPED, "stage" => stage.to_string()).increment(1);
}

/// Records merge duration.
pub fn record_merge_duration(table: &str, duration_secs: f64) {
    histogram!(MERGE_DURATION, "table" => table.to_string()).record(duration_secs);
}

fn as_u64(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}
