//! Quarantine (dead-letter) routing.
//!
//! One append-only table per stage. Every rejection is recorded, duplicates
//! included; rows leave quarantine only through an explicit administrative
//! [`QuarantineRouter::purge`].

use std::sync::Arc;

use serde_json::Value;
use strata_core::Redacted;
use strata_table::{Record, RowPredicate, TableCommit, TableStore, columns};

use crate::envelope::Envelope;
use crate::error::{IngestError, RejectReason, Result};
use crate::retry::commit_with_retry;
use crate::sanitize::Rejected;
use crate::types::Stage;

/// Quarantine column holding the original payload.
pub const PAYLOAD: &str = "payload";
/// Quarantine column holding the attempted cast (Silver only).
pub const ATTEMPTED: &str = "attempted";
/// Quarantine column holding the [`RejectReason`].
pub const ERROR_REASON: &str = "error_reason";
/// Quarantine column holding a human-readable detail.
pub const ERROR_DETAIL: &str = "error_detail";
/// Quarantine column holding the originating stage.
pub const STAGE: &str = "stage";

/// A rejected record on its way to quarantine.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineEntry {
    /// Record as it arrived at the rejecting stage.
    pub payload: Record,
    /// Cast attempt, when the rejection happened after casting.
    pub attempted: Option<Record>,
    /// Why the record was rejected.
    pub reason: RejectReason,
    /// Details (column, rule, path).
    pub detail: String,
}

impl QuarantineEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(
        payload: Record,
        attempted: Option<Record>,
        reason: RejectReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            attempted,
            reason,
            detail: detail.into(),
        }
    }

    /// Builds the persisted row. Envelope columns come from `envelope` when
    /// given, otherwise they are copied from the payload.
    #[must_use]
    pub fn into_row(self, stage: Stage, envelope: Option<&Envelope>) -> Record {
        let mut row = Record::new();
        match envelope {
            Some(envelope) => {
                for (name, value) in envelope.columns() {
                    row.insert(name.to_string(), value);
                }
            }
            None => {
                for name in columns::ENVELOPE {
                    let value = self.payload.get(name).cloned().unwrap_or(Value::Null);
                    row.insert(name.to_string(), value);
                }
            }
        }
        row.insert(ERROR_REASON.to_string(), Value::from(self.reason.as_str()));
        row.insert(ERROR_DETAIL.to_string(), Value::String(self.detail));
        row.insert(STAGE.to_string(), Value::from(stage.as_str()));
        row.insert(
            ATTEMPTED.to_string(),
            self.attempted.map_or(Value::Null, Value::Object),
        );
        row.insert(PAYLOAD.to_string(), Value::Object(self.payload));
        row
    }
}

impl From<Rejected> for QuarantineEntry {
    fn from(rejected: Rejected) -> Self {
        let detail = rejected.failure.to_string();
        Self::new(rejected.record, None, RejectReason::SanitizationFailed, detail)
    }
}

/// A deletion-compliance request against quarantine data.
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeRequest {
    /// Payload field to match.
    pub column: String,
    /// Value to match; never logged.
    pub value: Redacted<Value>,
    /// Who asked for the purge (recorded in the audit log).
    pub requested_by: String,
}

impl PurgeRequest {
    /// Creates a purge request.
    #[must_use]
    pub fn new(column: impl Into<String>, value: Value, requested_by: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: Redacted(value),
            requested_by: requested_by.into(),
        }
    }
}

/// Shared append-only sink for rejected records.
pub struct QuarantineRouter<T: ?Sized> {
    store: Arc<T>,
    bronze_table: String,
    silver_table: String,
    max_attempts: u32,
}

impl<T: ?Sized> std::fmt::Debug for QuarantineRouter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineRouter")
            .field("bronze_table", &self.bronze_table)
            .field("silver_table", &self.silver_table)
            .finish_non_exhaustive()
    }
}

impl<T> QuarantineRouter<T>
where
    T: TableStore + ?Sized,
{
    /// Creates a router over the two quarantine tables.
    #[must_use]
    pub fn new(
        store: Arc<T>,
        bronze_table: impl Into<String>,
        silver_table: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            bronze_table: bronze_table.into(),
            silver_table: silver_table.into(),
            max_attempts,
        }
    }

    /// Quarantine table for `stage`.
    #[must_use]
    pub fn table(&self, stage: Stage) -> &str {
        match stage {
            Stage::Bronze => &self.bronze_table,
            Stage::Silver => &self.silver_table,
        }
    }

    /// Appends `entries` to the quarantine table of `stage`.
    ///
    /// Returns the committed version, or `None` when there was nothing to
    /// write.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::WriteConflict`] once retries are exhausted, or
    /// the underlying store error.
    pub async fn route(
        &self,
        stage: Stage,
        entries: Vec<QuarantineEntry>,
        envelope: Option<&Envelope>,
    ) -> Result<Option<i64>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let table = self.table(stage);
        let count = entries.len();
        let rows: Vec<Record> = entries
            .into_iter()
            .map(|entry| entry.into_row(stage, envelope))
            .collect();

        let landed = commit_with_retry(self.store.as_ref(), table, self.max_attempts, |snapshot| {
            Ok(TableCommit::append(snapshot.version, rows.clone()))
        })
        .await?;

        tracing::info!(
            table,
            %stage,
            rows = count,
            version = landed.version,
            "records quarantined"
        );
        Ok(Some(landed.version))
    }

    /// Reads the live quarantine rows of `stage` for review.
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn rows(&self, stage: Stage) -> Result<Vec<Record>> {
        Ok(self.store.read_snapshot(self.table(stage)).await?.rows)
    }

    /// Removes quarantine rows whose payload field matches the request.
    ///
    /// Never invoked implicitly. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidBatch`] for an empty column or requester,
    /// [`IngestError::WriteConflict`] once retries are exhausted, or the
    /// underlying store error.
    pub async fn purge(&self, stage: Stage, request: &PurgeRequest) -> Result<usize> {
        if request.column.is_empty() || request.requested_by.is_empty() {
            return Err(IngestError::invalid_batch(
                "purge requires a payload column and a requester",
            ));
        }

        let table = self.table(stage);
        let predicate = RowPredicate::FieldEquals {
            path: vec![PAYLOAD.to_string(), request.column.clone()],
            value: request.value.expose().clone(),
        };

        let current = self.store.read_snapshot(table).await?;
        if !current.rows.iter().any(|row| predicate.matches(row)) {
            tracing::info!(
                table,
                column = %request.column,
                requested_by = %request.requested_by,
                removed = 0,
                "quarantine purge found no rows"
            );
            return Ok(0);
        }

        let landed = commit_with_retry(self.store.as_ref(), table, self.max_attempts, |snapshot| {
            Ok(TableCommit::delete(snapshot.version, predicate.clone()))
        })
        .await?;

        tracing::info!(
            table,
            column = %request.column,
            value = %request.value,
            requested_by = %request.requested_by,
            removed = landed.stats.rows_removed,
            version = landed.version,
            "quarantine purge"
        );
        Ok(landed.stats.rows_removed)
    }
}
