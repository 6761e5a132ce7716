//! Append-only Bronze ledger.
//!
//! Rows are only ever added. A forced replay replaces exactly the rows the
//! replayed run wrote (its batch id within its partition), so reprocessing
//! converges to the same state instead of duplicating rows, and other batches
//! sharing the partition are untouched. The Bronze contract evolves
//! additively: new columns are merged in, integer columns may widen to float,
//! any other type change is schema drift and nothing is written.

use std::sync::Arc;

use strata_table::{
    PartitionSpec, Record, RowPredicate, SchemaContract, SchemaDrift, TableCommit, TableStore,
};

use crate::error::{IngestError, Result};
use crate::retry::commit_with_retry;

/// How the ledger wrote a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Rows were appended.
    Append,
    /// A prior run's rows were replaced.
    Overwrite,
}

/// Outcome of a ledger commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCommit {
    /// Committed version; `None` for an empty batch.
    pub version: Option<i64>,
    /// Rows written.
    pub rows: usize,
    /// Prior rows removed by an overwrite.
    pub replaced: usize,
    /// Commit attempts used.
    pub attempts: u32,
    /// Append or overwrite.
    pub mode: WriteMode,
}

/// Idempotent, drift-aware append writer.
pub struct AppendOnlyLedger<T: ?Sized> {
    store: Arc<T>,
    table: String,
    max_attempts: u32,
}

impl<T: ?Sized> std::fmt::Debug for AppendOnlyLedger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendOnlyLedger")
            .field("table", &self.table)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<T> AppendOnlyLedger<T>
where
    T: TableStore + ?Sized,
{
    /// Creates a ledger writing to `table`.
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

    /// Commits `rows`, stamped for `partition`.
    ///
    /// With `replaces` the rows matching it are swapped for `rows`; otherwise
    /// rows are appended. Either every row becomes visible or none does.
    ///
    /// # Errors
    ///
    /// - [`IngestError::SchemaDriftViolation`] if a column's declared type
    ///   would change (nothing is written)
    /// - [`IngestError::WriteConflict`] once commit retries are exhausted
    pub async fn commit(
        &self,
        rows: Vec<Record>,
        partition: &PartitionSpec,
        replaces: Option<RowPredicate>,
    ) -> Result<LedgerCommit> {
        let mode = if replaces.is_some() {
            WriteMode::Overwrite
        } else {
            WriteMode::Append
        };

        if rows.is_empty() && mode == WriteMode::Append {
            return Ok(LedgerCommit {
                version: None,
                rows: 0,
                replaced: 0,
                attempts: 0,
                mode,
            });
        }

        let incoming = SchemaContract::infer(&rows).map_err(|drift| self.drift(drift))?;
        let row_count = rows.len();

        let landed = commit_with_retry(self.store.as_ref(), &self.table, self.max_attempts, |snapshot| {
            let contract = match &snapshot.contract {
                Some(current) => current.evolve(&incoming).map_err(|drift| self.drift(drift))?,
                None => incoming.clone(),
            };
            let commit = match &replaces {
                None => TableCommit::append(snapshot.version, rows.clone()),
                Some(scope) => TableCommit::overwrite(snapshot.version, rows.clone(), scope.clone()),
            };
            Ok(commit.with_contract(contract))
        })
        .await?;

        tracing::info!(
            table = %self.table,
            partition = %partition,
            version = landed.version,
            rows = row_count,
            replaced = landed.stats.rows_removed,
            ?mode,
            "bronze batch committed"
        );

        Ok(LedgerCommit {
            version: Some(landed.version),
            rows: row_count,
            replaced: landed.stats.rows_removed,
            attempts: landed.attempts,
            mode,
        })
    }

    fn drift(&self, drift: SchemaDrift) -> IngestError {
        tracing::warn!(
            table = %self.table,
            column = %drift.column,
            existing = %drift.existing,
            incoming = %drift.incoming,
            "schema drift"
        );
        IngestError::SchemaDriftViolation {
            table: self.table.clone(),
            column: drift.column,
            existing: drift.existing,
            incoming: drift.incoming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::{Value, json};
    use strata_core::MemoryBackend;
    use strata_table::{ColumnType, ObjectTableStore};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn partition() -> PartitionSpec {
        PartitionSpec::new("crm", NaiveDate::from_ymd_opt(2024, 5, 1).expect("date"))
    }

    fn row(id: i64) -> Record {
        record(json!({"id": id, "source_system": "crm", "ingest_date": "2024-05-01"}))
    }

    fn row_in_batch(id: i64, batch: &str) -> Record {
        let mut r = row(id);
        r.insert("batch_id".into(), json!(batch));
        r
    }

    fn ledger() -> (Arc<ObjectTableStore<MemoryBackend>>, AppendOnlyLedger<ObjectTableStore<MemoryBackend>>) {
        let store = Arc::new(ObjectTableStore::new(Arc::new(MemoryBackend::new())));
        let ledger = AppendOnlyLedger::new(Arc::clone(&store), "bronze", 4);
        (store, ledger)
    }

    #[tokio::test]
    async fn appends_and_evolves_contract() {
        let (store, ledger) = ledger();
        ledger
            .commit(vec![row(1)], &partition(), None)
            .await
            .expect("first");

        let mut wider = row(2);
        wider.insert("note".into(), json!("new column"));
        let second = ledger
            .commit(vec![wider], &partition(), None)
            .await
            .expect("second");
        assert_eq!(second.version, Some(1));
        assert_eq!(second.mode, WriteMode::Append);

        let snapshot = store.read_snapshot("bronze").await.expect("read");
        assert_eq!(snapshot.rows.len(), 2);
        let contract = snapshot.contract.expect("contract");
        assert_eq!(
            contract.column("note").map(|c| c.data_type),
            Some(ColumnType::String)
        );
    }

    #[tokio::test]
    async fn drift_writes_nothing() {
        let (store, ledger) = ledger();
        ledger
            .commit(vec![row(1)], &partition(), None)
            .await
            .expect("first");

        let mut drifted = row(2);
        drifted.insert("id".into(), json!("two"));
        let err = ledger
            .commit(vec![drifted], &partition(), None)
            .await
            .expect_err("drift");
        assert!(matches!(
            err,
            IngestError::SchemaDriftViolation { ref column, existing: ColumnType::Integer, incoming: ColumnType::String, .. } if column == "id"
        ));
        assert_eq!(store.read_snapshot("bronze").await.expect("read").version, 0);
    }

    #[tokio::test]
    async fn replacement_touches_only_the_replayed_batch() {
        let (store, ledger) = ledger();
        ledger
            .commit(vec![row_in_batch(1, "a"), row_in_batch(2, "a")], &partition(), None)
            .await
            .expect("batch a");
        ledger
            .commit(vec![row_in_batch(3, "b")], &partition(), None)
            .await
            .expect("batch b");

        let replay = ledger
            .commit(
                vec![row_in_batch(1, "c"), row_in_batch(2, "c")],
                &partition(),
                Some(RowPredicate::column_equals("batch_id", json!("a"))),
            )
            .await
            .expect("replay");
        assert_eq!(replay.mode, WriteMode::Overwrite);
        assert_eq!(replay.replaced, 2);

        let rows = store.read_snapshot("bronze").await.expect("read").rows;
        let mut batches: Vec<_> = rows.iter().map(|r| r["batch_id"].clone()).collect();
        batches.sort_by_key(ToString::to_string);
        assert_eq!(batches, vec![json!("b"), json!("c"), json!("c")]);
    }

    #[tokio::test]
    async fn integer_column_widens_to_float_across_batches() {
        let (store, ledger) = ledger();
        let priced = |price: Value| {
            let mut r = row(1);
            r.insert("price".into(), price);
            r
        };
        ledger
            .commit(vec![priced(json!(10))], &partition(), None)
            .await
            .expect("integer");
        ledger
            .commit(vec![priced(json!(10.5))], &partition(), None)
            .await
            .expect("float widens");
        ledger
            .commit(vec![priced(json!(11))], &partition(), None)
            .await
            .expect("integer still fits");

        let snapshot = store.read_snapshot("bronze").await.expect("read");
        assert_eq!(snapshot.rows.len(), 3);
        let contract = snapshot.contract.expect("contract");
        assert_eq!(
            contract.column("price").map(|c| c.data_type),
            Some(ColumnType::Float)
        );
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let (store, ledger) = ledger();
        let result = ledger
            .commit(Vec::new(), &partition(), None)
            .await
            .expect("empty");
        assert_eq!(result.version, None);
        assert!(store.read_snapshot("bronze").await.expect("read").is_empty_table());
    }
}
