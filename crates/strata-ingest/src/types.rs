//! Stage-level inputs and outputs shared by the runners and the replay guard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_table::{PartitionSpec, Record};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Sanitized raw ledger.
    Bronze,
    /// Typed, deduplicated table of record.
    Silver,
}

impl Stage {
    /// Returns the stage as a path segment and column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time range a source batch was extracted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl BatchWindow {
    /// Partition a windowed batch is identified by: its source on the UTC
    /// date the window starts. Independent of when the batch is ingested.
    #[must_use]
    pub fn partition(&self, source_system: &str) -> PartitionSpec {
        PartitionSpec::new(source_system, self.start.date_naive())
    }
}

/// A raw batch as supplied by a source connector.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    /// Originating source system.
    pub source_system: String,
    /// Raw records. Held in memory only until sanitized.
    pub records: Vec<Record>,
    /// Extraction window, when the connector reports one.
    pub window: Option<BatchWindow>,
}

impl SourceBatch {
    /// Creates a batch without an extraction window.
    #[must_use]
    pub fn new(source_system: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            source_system: source_system.into(),
            records,
            window: None,
        }
    }

    /// Sets the extraction window.
    #[must_use]
    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.window = Some(BatchWindow { start, end });
        self
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Re-execute even if the replay signature is recorded. Bronze replaces
    /// the rows the recorded run wrote instead of appending next to them.
    pub force_replay: bool,
}

impl RunOptions {
    /// Options for a forced replay.
    #[must_use]
    pub fn forced() -> Self {
        Self { force_replay: true }
    }
}

/// Counts reported by a completed stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Stage that ran.
    pub stage: Stage,
    /// Target table.
    pub table: String,
    /// Committed version; `None` when there was nothing to write.
    pub version: Option<i64>,
    /// Rows written to the target table.
    pub accepted: usize,
    /// Rows routed to quarantine.
    pub quarantined: usize,
    /// Rows dropped for a null primary key.
    pub dropped: usize,
    /// Accepted rows with at least one field nulled by a failed cast.
    pub flagged: usize,
    /// Replay signature of the run.
    pub signature: String,
}

/// Result of a stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and committed.
    Committed(CommitSummary),
    /// A prior run with the same signature was found; nothing was written.
    Skipped(CommitSummary),
}

impl StageOutcome {
    /// Summary of the run (the prior run's summary when skipped).
    #[must_use]
    pub fn summary(&self) -> &CommitSummary {
        match self {
            Self::Committed(summary) | Self::Skipped(summary) => summary,
        }
    }

    /// Returns true if the run was short-circuited.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}
