//! Shared table types (rows, operations, snapshots, commit results).

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::SchemaContract;

/// A table row: an ordered JSON object of column name to value.
pub type Record = serde_json::Map<String, Value>;

/// Envelope column names carried by every persisted row.
pub mod columns {
    /// UTC time the batch was ingested (RFC 3339).
    pub const INGEST_TIMESTAMP: &str = "ingest_timestamp";
    /// Identifier of the originating source system.
    pub const SOURCE_SYSTEM: &str = "source_system";
    /// Correlation id of the ingesting invocation.
    pub const BATCH_ID: &str = "batch_id";
    /// Partition date (`YYYY-MM-DD`) derived from the ingest timestamp.
    pub const INGEST_DATE: &str = "ingest_date";

    /// All envelope columns in persisted order.
    pub const ENVELOPE: [&str; 4] = [INGEST_TIMESTAMP, SOURCE_SYSTEM, BATCH_ID, INGEST_DATE];
}

/// Partition scope used by overwrite and replay: one source on one date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Source system the partition belongs to.
    pub source_system: String,
    /// Ingest date of the partition.
    pub ingest_date: NaiveDate,
}

impl PartitionSpec {
    /// Creates a partition spec.
    #[must_use]
    pub fn new(source_system: impl Into<String>, ingest_date: NaiveDate) -> Self {
        Self {
            source_system: source_system.into(),
            ingest_date,
        }
    }

    /// Returns true if `row` belongs to this partition.
    #[must_use]
    pub fn matches(&self, row: &Record) -> bool {
        row.get(columns::SOURCE_SYSTEM).and_then(Value::as_str) == Some(&self.source_system)
            && row
                .get(columns::INGEST_DATE)
                .and_then(Value::as_str)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                == Some(self.ingest_date)
    }
}

impl std::fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "source_system={}/ingest_date={}",
            self.source_system,
            self.ingest_date.format("%Y-%m-%d")
        )
    }
}

/// When a merge updates a matched row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchCondition {
    /// Update only if the incoming timestamp column is strictly newer.
    StrictlyNewer {
        /// Timestamp column compared between incoming and existing rows.
        column: String,
    },
    /// Always update matched rows.
    Always,
}

impl MatchCondition {
    /// Evaluates the condition for an incoming row against the existing row.
    #[must_use]
    pub fn should_update(&self, incoming: &Record, existing: &Record) -> bool {
        match self {
            Self::Always => true,
            Self::StrictlyNewer { column } => {
                compare_timestamps(incoming, existing, column) == Some(Ordering::Greater)
            }
        }
    }
}

/// Parses an RFC 3339 timestamp column.
#[must_use]
pub fn timestamp_of(row: &Record, column: &str) -> Option<DateTime<Utc>> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn compare_timestamps(a: &Record, b: &Record, column: &str) -> Option<Ordering> {
    Some(timestamp_of(a, column)?.cmp(&timestamp_of(b, column)?))
}

/// Row filter used by deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowPredicate {
    /// Matches rows where the (possibly nested) field at `path` equals `value`.
    FieldEquals {
        /// Object path, outermost key first.
        path: Vec<String>,
        /// Value to compare against.
        value: Value,
    },
    /// Matches rows in a partition.
    Partition(PartitionSpec),
    /// Matches rows satisfying every inner predicate.
    All {
        /// Predicates that must all hold.
        predicates: Vec<RowPredicate>,
    },
}

impl RowPredicate {
    /// Matches rows whose top-level `column` equals `value`.
    #[must_use]
    pub fn column_equals(column: impl Into<String>, value: Value) -> Self {
        Self::FieldEquals {
            path: vec![column.into()],
            value,
        }
    }

    /// Returns true if `row` satisfies the predicate.
    #[must_use]
    pub fn matches(&self, row: &Record) -> bool {
        match self {
            Self::Partition(spec) => spec.matches(row),
            Self::All { predicates } => predicates.iter().all(|p| p.matches(row)),
            Self::FieldEquals { path, value } => {
                let Some((first, rest)) = path.split_first() else {
                    return false;
                };
                let mut current = row.get(first);
                for segment in rest {
                    current = current.and_then(|v| v.get(segment));
                }
                current == Some(value)
            }
        }
    }
}

/// A write against a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TableOperation {
    /// Adds rows; never touches existing rows.
    Append {
        /// Rows to add.
        rows: Vec<Record>,
    },
    /// Removes every row matching `scope`, then adds `rows`.
    Overwrite {
        /// Replacement rows.
        rows: Vec<Record>,
        /// Rows being replaced.
        scope: RowPredicate,
    },
    /// Key-based upsert.
    Merge {
        /// Incoming rows; keys must be unique within the set.
        rows: Vec<Record>,
        /// Columns forming the primary key.
        key_columns: Vec<String>,
        /// When a matched row is replaced.
        condition: MatchCondition,
        /// Whether unmatched rows are inserted.
        insert_unmatched: bool,
    },
    /// Removes rows matching a predicate.
    Delete {
        /// Rows to remove.
        predicate: RowPredicate,
    },
    /// Commits a new version whose rows and contract equal a retained snapshot.
    Restore {
        /// Version to restore.
        version: i64,
    },
}

impl TableOperation {
    /// Returns the operation kind recorded in the snapshot.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Append { .. } => OperationKind::Append,
            Self::Overwrite { .. } => OperationKind::Overwrite,
            Self::Merge { .. } => OperationKind::Merge,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Restore { .. } => OperationKind::Restore,
        }
    }
}

/// Kind of operation that produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// See [`TableOperation::Append`].
    Append,
    /// See [`TableOperation::Overwrite`].
    Overwrite,
    /// See [`TableOperation::Merge`].
    Merge,
    /// See [`TableOperation::Delete`].
    Delete,
    /// See [`TableOperation::Restore`].
    Restore,
}

/// A commit request: an operation against the version the caller read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCommit {
    /// Optimistic concurrency token: the snapshot version the caller read.
    pub read_version: i64,
    /// The write.
    pub operation: TableOperation,
    /// Replacement contract, committed atomically with the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<SchemaContract>,
}

impl TableCommit {
    /// Append `rows`.
    #[must_use]
    pub fn append(read_version: i64, rows: Vec<Record>) -> Self {
        Self::new(read_version, TableOperation::Append { rows })
    }

    /// Replace the rows matching `scope` with `rows`.
    #[must_use]
    pub fn overwrite(read_version: i64, rows: Vec<Record>, scope: RowPredicate) -> Self {
        Self::new(read_version, TableOperation::Overwrite { rows, scope })
    }

    /// Upsert `rows` keyed by `key_columns`, replacing matches only when
    /// `condition` holds and inserting the rest.
    #[must_use]
    pub fn merge(
        read_version: i64,
        rows: Vec<Record>,
        key_columns: Vec<String>,
        condition: MatchCondition,
    ) -> Self {
        Self::new(
            read_version,
            TableOperation::Merge {
                rows,
                key_columns,
                condition,
                insert_unmatched: true,
            },
        )
    }

    /// Remove rows matching `predicate`.
    #[must_use]
    pub fn delete(read_version: i64, predicate: RowPredicate) -> Self {
        Self::new(read_version, TableOperation::Delete { predicate })
    }

    /// Wraps an arbitrary operation.
    #[must_use]
    pub fn new(read_version: i64, operation: TableOperation) -> Self {
        Self {
            read_version,
            operation,
            contract: None,
        }
    }

    /// Commits `contract` together with the write.
    #[must_use]
    pub fn with_contract(mut self, contract: SchemaContract) -> Self {
        self.contract = Some(contract);
        self
    }
}

/// Row counts produced by a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    /// Rows that did not exist before.
    pub rows_added: usize,
    /// Matched rows that were replaced.
    pub rows_updated: usize,
    /// Rows removed (overwrite/delete).
    pub rows_removed: usize,
    /// Matched rows left unchanged.
    pub rows_unchanged: usize,
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// The write is visible at `version`.
    Committed {
        /// Newly committed version.
        version: i64,
        /// Row counts.
        stats: CommitStats,
    },
    /// Another writer committed first; re-read and retry.
    Conflict {
        /// Latest version observed by the store.
        current_version: i64,
    },
}

/// An immutable, versioned view of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Snapshot version (`-1` for a table with no commits).
    pub version: i64,
    /// Declared contract, if any commit installed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<SchemaContract>,
    /// Live rows.
    pub rows: Vec<Record>,
    /// Commit time of this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
    /// Operation that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    /// Row counts of the producing commit.
    #[serde(default)]
    pub stats: CommitStats,
}

impl TableSnapshot {
    /// Snapshot of a table that has never been committed to.
    #[must_use]
    pub fn empty(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            version: -1,
            contract: None,
            rows: Vec::new(),
            committed_at: None,
            operation: None,
            stats: CommitStats::default(),
        }
    }

    /// Returns true if no commit exists yet.
    #[must_use]
    pub fn is_empty_table(&self) -> bool {
        self.version < 0
    }

    /// Rows belonging to `partition`.
    pub fn partition_rows<'a>(
        &'a self,
        partition: &'a PartitionSpec,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.rows.iter().filter(move |row| partition.matches(row))
    }
}
