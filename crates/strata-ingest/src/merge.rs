//! Key-based upsert into the Silver table.
//!
//! Per key: no live row inserts; a live row is replaced only when the incoming
//! `ingest_timestamp` is strictly newer. The whole batch lands in one commit.
//! A losing concurrent merge re-reads and resubmits; because the match rule
//! only ever moves a key forward in time, resubmitting against a fresher
//! snapshot applies exactly the still-pending updates.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use strata_table::{
    MatchCondition, Record, SchemaContract, TableCommit, TableSnapshot, TableStore, columns,
    timestamp_of,
};

use crate::contract::SilverContract;
use crate::error::{IngestError, Result};
use crate::metrics::record_merge_duration;
use crate::retry::commit_with_retry;

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Committed version; `None` when there was nothing to merge.
    pub version: Option<i64>,
    /// Keys that had no live row.
    pub inserted: usize,
    /// Live rows replaced by a strictly newer row.
    pub updated: usize,
    /// Keys whose live row was equal or newer.
    pub unchanged: usize,
    /// Rows discarded because a newer row with the same key was in the batch.
    pub collapsed: usize,
    /// Commit attempts used.
    pub attempts: u32,
}

/// Upserts typed rows into a Silver table.
pub struct MergeEngine<T: ?Sized> {
    store: Arc<T>,
    table: String,
    max_attempts: u32,
}

impl<T: ?Sized> std::fmt::Debug for MergeEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("table", &self.table)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<T> MergeEngine<T>
where
    T: TableStore + ?Sized,
{
    /// Creates an engine merging into `table`.
    #[must_use]
    pub fn new(store: Arc<T>, table: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            store,
            table: table.into(),
            max_attempts,
        }
    }

    /// Target table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Merges `rows` under `contract`.
    ///
    /// Duplicate keys within `rows` are collapsed first. The first merge into
    /// an empty table installs the contract's table schema.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidBatch`] if a row carries a null key
    /// - [`IngestError::ContractMismatch`] if the stored contract differs
    /// - [`IngestError::WriteConflict`] once commit retries are exhausted
    pub async fn merge(&self, rows: Vec<Record>, contract: &SilverContract) -> Result<MergeReport> {
        if rows.is_empty() {
            return Ok(MergeReport::default());
        }

        let started = Instant::now();
        let (rows, collapsed) = collapse_duplicates(rows, &contract.primary_key)?;
        let expected = contract.table_schema();
        let condition = MatchCondition::StrictlyNewer {
            column: columns::INGEST_TIMESTAMP.to_string(),
        };

        let landed = commit_with_retry(self.store.as_ref(), &self.table, self.max_attempts, |snapshot| {
            let install = self.check_contract(snapshot, &expected)?;
            let commit = TableCommit::merge(
                snapshot.version,
                rows.clone(),
                contract.primary_key.clone(),
                condition.clone(),
            );
            Ok(if install {
                commit.with_contract(expected.clone())
            } else {
                commit
            })
        })
        .await?;

        record_merge_duration(&self.table, started.elapsed().as_secs_f64());

        let report = MergeReport {
            version: Some(landed.version),
            inserted: landed.stats.rows_added,
            updated: landed.stats.rows_updated,
            unchanged: landed.stats.rows_unchanged,
            collapsed,
            attempts: landed.attempts,
        };
        tracing::info!(
            table = %self.table,
            version = landed.version,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            collapsed,
            attempts = landed.attempts,
            "merge committed"
        );
        Ok(report)
    }

    /// Replaces the stored contract with `next`, which must carry a higher
    /// version. Rows are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if `next` is inconsistent, or a
    /// [`strata_table::TableError::ContractMigration`] if the store refuses
    /// the replacement.
    pub async fn migrate_contract(&self, next: &SilverContract) -> Result<i64> {
        next.validate()?;
        let schema = next.table_schema();

        let landed = commit_with_retry(self.store.as_ref(), &self.table, self.max_attempts, |snapshot| {
            Ok(TableCommit::append(snapshot.version, Vec::new()).with_contract(schema.clone()))
        })
        .await?;

        tracing::info!(
            table = %self.table,
            version = landed.version,
            contract_version = next.schema.version,
            "silver contract migrated"
        );
        Ok(landed.version)
    }

    /// Returns true if the contract must be installed with this commit.
    fn check_contract(&self, snapshot: &TableSnapshot, expected: &SchemaContract) -> Result<bool> {
        match &snapshot.contract {
            None => Ok(true),
            Some(stored) if stored == expected => Ok(false),
            Some(stored) => Err(IngestError::ContractMismatch {
                table: self.table.clone(),
                message: format!(
                    "stored contract is v{} with {} columns, stage supplied v{} with {}",
                    stored.version,
                    stored.columns.len(),
                    expected.version,
                    expected.columns.len()
                ),
            }),
        }
    }
}

/// Keeps one row per key: the highest `ingest_timestamp` wins, ties go to the
/// row with the greatest canonical JSON text. Survivors keep the position of
/// their key's first occurrence.
///
/// Returns the survivors and the number of rows discarded.
///
/// # Errors
///
/// Returns [`IngestError::InvalidBatch`] if a key column is null, or
/// [`IngestError::Serialization`] if a row cannot be canonicalized.
pub fn collapse_duplicates(rows: Vec<Record>, key_columns: &[String]) -> Result<(Vec<Record>, usize)> {
    let total = rows.len();
    let mut survivors: Vec<Record> = Vec::with_capacity(total);
    let mut index: HashMap<String, usize> = HashMap::with_capacity(total);

    for row in rows {
        let key = row_key(&row, key_columns)?;
        match index.get(&key) {
            Some(&position) => {
                if supersedes(&row, &survivors[position])? {
                    survivors[position] = row;
                }
            }
            None => {
                index.insert(key, survivors.len());
                survivors.push(row);
            }
        }
    }

    let collapsed = total - survivors.len();
    Ok((survivors, collapsed))
}

fn supersedes(candidate: &Record, current: &Record) -> Result<bool> {
    let by_time = timestamp_of(candidate, columns::INGEST_TIMESTAMP)
        .cmp(&timestamp_of(current, columns::INGEST_TIMESTAMP));
    Ok(match by_time {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => canonical(candidate)? > canonical(current)?,
    })
}

fn row_key(row: &Record, key_columns: &[String]) -> Result<String> {
    let mut parts: Vec<&Value> = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        match row.get(column) {
            None | Some(Value::Null) => {
                return Err(IngestError::invalid_batch(format!(
                    "merge row has a null key column `{column}`"
                )));
            }
            Some(value) => parts.push(value),
        }
    }
    serde_jcs::to_string(&parts)
        .map_err(|e| IngestError::serialization(format!("failed to canonicalize key: {e}")))
}

fn canonical(row: &Record) -> Result<String> {
    serde_jcs::to_string(row)
        .map_err(|e| IngestError::serialization(format!("failed to canonicalize row: {e}")))
}
