//! Stage runners.
//!
//! [`BronzeStage`] turns a raw source batch into sanitized, stamped ledger
//! rows. [`SilverStage`] reads one Bronze partition, types and validates it,
//! and merges it into the table of record. Each invocation returns a
//! [`StageOutcome`] or a terminal [`IngestError`]; row-level problems never
//! fail a stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use strata_core::{StorageBackend, stage_span};
use strata_table::{PartitionSpec, Record, TableStore};
use tracing::Instrument;

use crate::cast::TypeCastGate;
use crate::config::IngestConfig;
use crate::contract::SilverContract;
use crate::envelope::{BatchId, Envelope};
use crate::error::{IngestError, RejectReason, Result};
use crate::ledger::AppendOnlyLedger;
use crate::merge::MergeEngine;
use crate::metrics::{record_replay_skip, record_stage_counts};
use crate::quarantine::{QuarantineEntry, QuarantineRouter};
use crate::replay::{BatchRows, ReplayController, ReplayMarker, ReplaySignature, canonical_hash};
use crate::sanitize::{SanitizationBarrier, SanitizedBatch};
use crate::types::{CommitSummary, RunOptions, SourceBatch, Stage, StageOutcome};

/// Raw batch to Bronze ledger.
pub struct BronzeStage<T: ?Sized, S: ?Sized> {
    barrier: SanitizationBarrier,
    ledger: AppendOnlyLedger<T>,
    quarantine: QuarantineRouter<T>,
    replay: ReplayController<S>,
}

impl<T: ?Sized, S: ?Sized> std::fmt::Debug for BronzeStage<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BronzeStage")
            .field("ledger", &self.ledger)
            .field("quarantine", &self.quarantine)
            .finish_non_exhaustive()
    }
}

impl<T, S> BronzeStage<T, S>
where
    T: TableStore + ?Sized,
    S: StorageBackend + ?Sized,
{
    /// Creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: &IngestConfig,
        barrier: SanitizationBarrier,
        store: Arc<T>,
        storage: Arc<S>,
    ) -> Result<Self> {
        config.validate()?;
        let retries = config.max_commit_retries;
        Ok(Self {
            barrier,
            ledger: AppendOnlyLedger::new(Arc::clone(&store), &config.bronze_table, retries),
            quarantine: QuarantineRouter::new(
                store,
                &config.bronze_quarantine_table,
                &config.silver_quarantine_table,
                retries,
            ),
            replay: ReplayController::new(storage),
        })
    }

    /// Quarantine router used by this stage (for review and purge).
    #[must_use]
    pub fn quarantine(&self) -> &QuarantineRouter<T> {
        &self.quarantine
    }

    /// Ingests `batch` into the Bronze ledger.
    ///
    /// `now` is read once by the caller and becomes the batch's
    /// `ingest_timestamp`; its UTC date selects the partition.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidBatch`] for an empty source identifier
    /// - [`IngestError::SchemaDriftViolation`] if the batch would change a
    ///   column type; the batch is routed to quarantine and nothing reaches
    ///   the ledger
    /// - [`IngestError::WriteConflict`] once commit retries are exhausted
    #[tracing::instrument(
        skip_all,
        fields(source_system = %batch.source_system, records = batch.records.len(), force = options.force_replay)
    )]
    pub async fn run(
        &self,
        batch: SourceBatch,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        if batch.source_system.trim().is_empty() {
            return Err(IngestError::invalid_batch("source_system must not be empty"));
        }

        let batch_id = BatchId::generate();
        let span = stage_span(Stage::Bronze.as_str(), self.ledger.table(), &batch_id.to_string());
        self.execute(batch, batch_id, options, now)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        batch: SourceBatch,
        batch_id: BatchId,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let envelope = Envelope::capture(&batch.source_system, batch_id, now);
        let partition = envelope.partition();

        // A windowed batch is identified by its window alone, so a replay after
        // midnight still matches. Without a window the batch content identifies
        // the run within the ingest day.
        let (identity, input) = match &batch.window {
            Some(window) => (window.partition(&batch.source_system), None),
            None => (partition.clone(), Some(batch_digest(&batch.records)?)),
        };
        let signature = ReplaySignature::compute(
            Stage::Bronze,
            &batch.source_system,
            batch.window.as_ref(),
            &identity,
            input.as_deref(),
        )?;

        let prior = match admit(&self.replay, Stage::Bronze, &signature, options).await? {
            Admission::Skip(outcome) => return Ok(outcome),
            Admission::Run(prior) => prior,
        };
        let replaces = prior
            .and_then(|marker| marker.written)
            .as_ref()
            .map(BatchRows::scope);

        let SanitizedBatch { records, rejected } = self.barrier.sanitize(batch.records);
        let rows = envelope.stamp(records);
        let quarantined = rejected.len();

        let entries = rejected.into_iter().map(QuarantineEntry::from).collect();
        self.quarantine
            .route(Stage::Bronze, entries, Some(&envelope))
            .await?;

        let committed = match self
            .ledger
            .commit(rows.clone(), &partition, replaces)
            .await
        {
            Ok(committed) => committed,
            Err(err @ IngestError::SchemaDriftViolation { .. }) => {
                let detail = err.to_string();
                let entries = rows
                    .into_iter()
                    .map(|row| QuarantineEntry::new(row, None, RejectReason::SchemaDrift, detail.clone()))
                    .collect();
                self.quarantine
                    .route(Stage::Bronze, entries, Some(&envelope))
                    .await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let summary = CommitSummary {
            stage: Stage::Bronze,
            table: self.ledger.table().to_string(),
            version: committed.version,
            accepted: committed.rows,
            quarantined,
            dropped: 0,
            flagged: 0,
            signature: signature.to_string(),
        };
        let written = BatchRows {
            batch_id,
            partition,
        };
        finish(&self.replay, signature, summary, Some(written), options, now).await
    }
}

/// Bronze partition to Silver table.
pub struct SilverStage<T: ?Sized, S: ?Sized> {
    store: Arc<T>,
    bronze_table: String,
    merge: MergeEngine<T>,
    quarantine: QuarantineRouter<T>,
    replay: ReplayController<S>,
}

impl<T: ?Sized, S: ?Sized> std::fmt::Debug for SilverStage<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SilverStage")
            .field("bronze_table", &self.bronze_table)
            .field("merge", &self.merge)
            .field("quarantine", &self.quarantine)
            .finish_non_exhaustive()
    }
}

impl<T, S> SilverStage<T, S>
where
    T: TableStore + ?Sized,
    S: StorageBackend + ?Sized,
{
    /// Creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &IngestConfig, store: Arc<T>, storage: Arc<S>) -> Result<Self> {
        config.validate()?;
        let retries = config.max_commit_retries;
        Ok(Self {
            store: Arc::clone(&store),
            bronze_table: config.bronze_table.clone(),
            merge: MergeEngine::new(Arc::clone(&store), &config.silver_table, retries),
            quarantine: QuarantineRouter::new(
                store,
                &config.bronze_quarantine_table,
                &config.silver_quarantine_table,
                retries,
            ),
            replay: ReplayController::new(storage),
        })
    }

    /// Merge engine used by this stage (for contract migrations).
    #[must_use]
    pub fn merge_engine(&self) -> &MergeEngine<T> {
        &self.merge
    }

    /// Quarantine router used by this stage (for review and purge).
    #[must_use]
    pub fn quarantine(&self) -> &QuarantineRouter<T> {
        &self.quarantine
    }

    /// Refines one Bronze partition into the Silver table under `contract`.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidConfig`] if `contract` is inconsistent
    /// - [`IngestError::ContractMismatch`] if the Silver table was created
    ///   under a different contract
    /// - [`IngestError::WriteConflict`] once commit retries are exhausted
    #[tracing::instrument(
        skip_all,
        fields(partition = %partition, contract_version = contract.schema.version, force = options.force_replay)
    )]
    pub async fn run(
        &self,
        partition: PartitionSpec,
        contract: &SilverContract,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let gate = TypeCastGate::new(contract)?;
        let run_id = BatchId::generate();
        let span = stage_span(Stage::Silver.as_str(), self.merge.table(), &run_id.to_string());
        self.execute(partition, contract, &gate, options, now)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        partition: PartitionSpec,
        contract: &SilverContract,
        gate: &TypeCastGate,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let bronze = self.store.read_snapshot(&self.bronze_table).await?;
        let rows: Vec<Record> = bronze.partition_rows(&partition).cloned().collect();
        tracing::debug!(bronze_version = bronze.version, rows = rows.len(), "bronze partition read");

        // The partition's content and the contract version identify what this
        // run reads; writes to other partitions leave it unchanged.
        let input = format!(
            "{}#{};contract@{}",
            self.bronze_table,
            batch_digest(&rows)?,
            contract.schema.version
        );
        let signature = ReplaySignature::compute(
            Stage::Silver,
            &partition.source_system,
            None,
            &partition,
            Some(&input),
        )?;

        if let Admission::Skip(outcome) =
            admit(&self.replay, Stage::Silver, &signature, options).await?
        {
            return Ok(outcome);
        }

        let outcome = gate.apply(rows);
        for flag in &outcome.flags {
            tracing::debug!(
                column = %flag.column,
                target = %flag.target,
                reason = %flag.message,
                "field nulled by failed cast"
            );
        }

        let quarantined = outcome.quarantined.len();
        self.quarantine
            .route(Stage::Silver, outcome.quarantined, None)
            .await?;

        let accepted = outcome.clean.len();
        let report = self.merge.merge(outcome.clean, contract).await?;

        let summary = CommitSummary {
            stage: Stage::Silver,
            table: self.merge.table().to_string(),
            version: report.version,
            accepted,
            quarantined,
            dropped: outcome.dropped,
            flagged: outcome.flagged,
            signature: signature.to_string(),
        };
        finish(&self.replay, signature, summary, None, options, now).await
    }
}

/// Whether a run proceeds.
enum Admission {
    /// The signature is recorded and replay is not forced.
    Skip(StageOutcome),
    /// Execute; carries the prior marker of a forced replay.
    Run(Option<ReplayMarker>),
}

async fn admit<S>(
    replay: &ReplayController<S>,
    stage: Stage,
    signature: &ReplaySignature,
    options: RunOptions,
) -> Result<Admission>
where
    S: StorageBackend + ?Sized,
{
    let Some(marker) = replay.lookup(stage, signature).await? else {
        return Ok(Admission::Run(None));
    };
    if options.force_replay {
        tracing::info!(%stage, %signature, "forced replay of a recorded run");
        return Ok(Admission::Run(Some(marker)));
    }

    record_replay_skip(stage.as_str());
    tracing::info!(
        %stage,
        %signature,
        prior_version = ?marker.summary.version,
        "replay signature recorded; skipping"
    );
    Ok(Admission::Skip(StageOutcome::Skipped(marker.summary)))
}

/// Records the replay marker and metrics for a committed run.
async fn finish<S>(
    replay: &ReplayController<S>,
    signature: ReplaySignature,
    summary: CommitSummary,
    written: Option<BatchRows>,
    options: RunOptions,
    now: DateTime<Utc>,
) -> Result<StageOutcome>
where
    S: StorageBackend + ?Sized,
{
    let marker = ReplayMarker {
        signature,
        stage: summary.stage,
        summary,
        recorded_at: now,
        written,
    };
    replay.record(&marker, options.force_replay).await?;

    let summary = marker.summary;
    record_stage_counts(
        summary.stage.as_str(),
        summary.accepted,
        summary.quarantined,
        summary.dropped,
        summary.flagged,
    );
    tracing::info!(
        stage = %summary.stage,
        table = %summary.table,
        version = ?summary.version,
        accepted = summary.accepted,
        quarantined = summary.quarantined,
        dropped = summary.dropped,
        flagged = summary.flagged,
        "stage committed"
    );
    Ok(StageOutcome::Committed(summary))
}

fn batch_digest(records: &[Record]) -> Result<String> {
    let content = Value::Array(records.iter().cloned().map(Value::Object).collect());
    canonical_hash(&content)
}
