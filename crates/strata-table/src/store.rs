//! Table store contract and the object-storage reference implementation.
//!
//! [`ObjectTableStore`] keeps one immutable JSON snapshot per version and uses
//! a `DoesNotExist` write of the next version as the atomic commit point, so:
//! - a commit is all-or-nothing (the snapshot either exists or it does not)
//! - two writers racing for the same version cannot both win
//! - dropping a commit future before the write leaves no trace
//! - prior versions stay readable for recovery and restore

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use strata_core::storage::{JsonStore, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Result, TableError};
use crate::schema::SchemaContract;
use crate::types::{
    CommitResult, CommitStats, MatchCondition, Record, TableCommit, TableOperation, TableSnapshot,
};

/// Transactional table store.
///
/// Implementations must provide atomic commits, conflict signaling when
/// `read_version` is stale, and retained prior snapshots.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Reads the latest snapshot (an empty snapshot at version `-1` if the
    /// table has no commits).
    async fn read_snapshot(&self, table: &str) -> Result<TableSnapshot>;

    /// Reads a retained snapshot by version.
    async fn read_snapshot_at(&self, table: &str, version: i64) -> Result<Option<TableSnapshot>>;

    /// Commits `commit` if `commit.read_version` is still the latest version.
    async fn commit(&self, table: &str, commit: TableCommit) -> Result<CommitResult>;
}

/// Table store backed by a CAS object store.
pub struct ObjectTableStore<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: ?Sized> Clone for ObjectTableStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for ObjectTableStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTableStore").finish_non_exhaustive()
    }
}

impl<S> ObjectTableStore<S>
where
    S: StorageBackend + ?Sized,
{
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Lists retained versions of `table` in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the table name is invalid or listing fails.
    pub async fn list_versions(&self, table: &str) -> Result<Vec<i64>> {
        validate_table_name(table)?;
        let prefix = log_prefix(table);
        let mut versions: Vec<i64> = self
            .storage
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|meta| parse_log_version(&prefix, &meta.path))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn load(&self, table: &str, version: i64) -> Result<Option<TableSnapshot>> {
        let path = log_path(table, version)?;
        let loaded: Option<(TableSnapshot, String)> = self.storage.read_json(&path).await?;
        Ok(loaded.map(|(snapshot, _)| snapshot))
    }

    async fn apply(
        &self,
        table: &str,
        base: &TableSnapshot,
        operation: &TableOperation,
    ) -> Result<(Vec<Record>, Option<SchemaContract>, CommitStats)> {
        let mut stats = CommitStats::default();
        let contract = base.contract.clone();

        let rows = match operation {
            TableOperation::Append { rows } => {
                stats.rows_added = rows.len();
                let mut out = base.rows.clone();
                out.extend(rows.iter().cloned());
                out
            }
            TableOperation::Overwrite { rows, scope } => {
                let mut out: Vec<Record> = base
                    .rows
                    .iter()
                    .filter(|row| !scope.matches(row))
                    .cloned()
                    .collect();
                stats.rows_removed = base.rows.len() - out.len();
                stats.rows_added = rows.len();
                out.extend(rows.iter().cloned());
                out
            }
            TableOperation::Merge {
                rows,
                key_columns,
                condition,
                insert_unmatched,
            } => apply_merge(
                &base.rows,
                rows,
                key_columns,
                condition,
                *insert_unmatched,
                &mut stats,
            )?,
            TableOperation::Delete { predicate } => {
                let out: Vec<Record> = base
                    .rows
                    .iter()
                    .filter(|row| !predicate.matches(row))
                    .cloned()
                    .collect();
                stats.rows_removed = base.rows.len() - out.len();
                out
            }
            TableOperation::Restore { version } => {
                let restored = self.load(table, *version).await?.ok_or_else(|| {
                    TableError::SnapshotNotFound {
                        table: table.to_string(),
                        version: *version,
                    }
                })?;
                stats.rows_removed = base.rows.len();
                stats.rows_added = restored.rows.len();
                return Ok((restored.rows, restored.contract, stats));
            }
        };

        Ok((rows, contract, stats))
    }
}

#[async_trait]
impl<S> TableStore for ObjectTableStore<S>
where
    S: StorageBackend + ?Sized,
{
    async fn read_snapshot(&self, table: &str) -> Result<TableSnapshot> {
        let Some(&latest) = self.list_versions(table).await?.last() else {
            return Ok(TableSnapshot::empty(table));
        };
        self.load(table, latest)
            .await?
            .ok_or_else(|| TableError::SnapshotNotFound {
                table: table.to_string(),
                version: latest,
            })
    }

    async fn read_snapshot_at(&self, table: &str, version: i64) -> Result<Option<TableSnapshot>> {
        validate_table_name(table)?;
        if version < 0 {
            return Ok(None);
        }
        self.load(table, version).await
    }

    async fn commit(&self, table: &str, commit: TableCommit) -> Result<CommitResult> {
        let base = self.read_snapshot(table).await?;
        if base.version != commit.read_version {
            tracing::debug!(
                table,
                read_version = commit.read_version,
                current_version = base.version,
                "stale read version"
            );
            return Ok(CommitResult::Conflict {
                current_version: base.version,
            });
        }

        let (rows, mut contract, stats) = self.apply(table, &base, &commit.operation).await?;

        if let Some(next) = commit.contract {
            if let Some(current) = &contract {
                current
                    .check_replacement(&next)
                    .map_err(|message| TableError::contract_migration(table, message))?;
            }
            contract = Some(next);
        }

        let version = base
            .version
            .checked_add(1)
            .ok_or_else(|| TableError::bad_request("table version overflow"))?;

        let snapshot = TableSnapshot {
            table: table.to_string(),
            version,
            contract,
            rows,
            committed_at: Some(Utc::now()),
            operation: Some(commit.operation.kind()),
            stats,
        };

        let path = log_path(table, version)?;
        match self
            .storage
            .write_json(&path, &snapshot, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::debug!(table, version, ?stats, "table commit");
                Ok(CommitResult::Committed { version, stats })
            }
            WriteResult::PreconditionFailed { .. } => Ok(CommitResult::Conflict {
                current_version: version,
            }),
        }
    }
}

fn apply_merge(
    existing: &[Record],
    incoming: &[Record],
    key_columns: &[String],
    condition: &MatchCondition,
    insert_unmatched: bool,
    stats: &mut CommitStats,
) -> Result<Vec<Record>> {
    if key_columns.is_empty() {
        return Err(TableError::bad_request("merge requires at least one key column"));
    }

    let mut out = existing.to_vec();
    let mut index: HashMap<String, usize> = HashMap::with_capacity(out.len());
    for (position, row) in out.iter().enumerate() {
        if let Some(key) = row_key(row, key_columns)? {
            index.insert(key, position);
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(incoming.len());
    for row in incoming {
        let key = row_key(row, key_columns)?.ok_or_else(|| {
            TableError::bad_request("merge rows must carry non-null key columns")
        })?;
        if !seen.insert(key.clone()) {
            return Err(TableError::bad_request(format!(
                "merge rows contain duplicate key {key}"
            )));
        }

        match index.get(&key) {
            Some(&position) => {
                if condition.should_update(row, &out[position]) {
                    out[position] = row.clone();
                    stats.rows_updated += 1;
                } else {
                    stats.rows_unchanged += 1;
                }
            }
            None if insert_unmatched => {
                index.insert(key, out.len());
                out.push(row.clone());
                stats.rows_added += 1;
            }
            None => {}
        }
    }

    Ok(out)
}

/// Canonical key of a row, or `None` if any key column is null/missing.
fn row_key(row: &Record, key_columns: &[String]) -> Result<Option<String>> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        match row.get(column) {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => parts.push(value),
        }
    }
    serde_jcs::to_string(&parts)
        .map(Some)
        .map_err(|e| TableError::serialization(format!("failed to canonicalize key: {e}")))
}

fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TableError::bad_request(format!(
            "table name must match [a-z0-9_]+, got {table:?}"
        )))
    }
}

fn log_prefix(table: &str) -> String {
    format!("tables/{table}/_log/")
}

fn log_path(table: &str, version: i64) -> Result<String> {
    validate_table_name(table)?;
    if version < 0 {
        return Err(TableError::bad_request("table version must be non-negative"));
    }
    Ok(format!("{}{version:020}.json", log_prefix(table)))
}

fn parse_log_version(prefix: &str, path: &str) -> Option<i64> {
    path.strip_prefix(prefix)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
