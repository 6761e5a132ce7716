//! Replay idempotency for stage runs.
//!
//! A run is identified by a signature over what it reads: stage, source,
//! extraction window, partition, and an optional input discriminator (the
//! digest of a windowless batch, or the digest of the Bronze partition a
//! Silver run read). After a successful commit the runner records a marker
//! holding the run's summary and, for Bronze, the rows it wrote; a later run
//! with the same signature short-circuits and reports that summary instead of
//! writing, while a forced run replaces exactly those rows.
//!
//! ## Storage Layout
//!
//! ```text
//! _replay/{stage}/{signature_prefix}/{signature}.json
//! ```
//!
//! Where `signature_prefix` is the first two hex characters of the signature.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_core::{JsonStore, StorageBackend, WritePrecondition, WriteResult};
use strata_table::{PartitionSpec, RowPredicate, columns};

use crate::envelope::{BatchId, format_timestamp};
use crate::error::{IngestError, Result};
use crate::types::{BatchWindow, CommitSummary, Stage};

/// Prefix for replay markers.
pub const REPLAY_PREFIX: &str = "_replay";

/// Hex SHA-256 identifying one stage run over one input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplaySignature(String);

impl ReplaySignature {
    /// Computes the signature of a run.
    ///
    /// `input` distinguishes runs that share a window and partition but read
    /// different data.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Serialization`] if the inputs cannot be
    /// canonicalized.
    pub fn compute(
        stage: Stage,
        source_system: &str,
        window: Option<&BatchWindow>,
        partition: &PartitionSpec,
        input: Option<&str>,
    ) -> Result<Self> {
        let request = serde_json::json!({
            "stage": stage,
            "source_system": source_system,
            "window_start": window.map(|w| format_timestamp(w.start)),
            "window_end": window.map(|w| format_timestamp(w.end)),
            "partition": partition,
            "input": input,
        });
        canonical_hash(&request).map(Self)
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage path of the marker for this signature.
    #[must_use]
    pub fn storage_path(&self, stage: Stage) -> String {
        let prefix = &self.0[..2.min(self.0.len())];
        format!("{REPLAY_PREFIX}/{}/{prefix}/{}.json", stage.as_str(), self.0)
    }
}

impl std::fmt::Display for ReplaySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 hex of the RFC 8785 canonical form of `value`.
///
/// # Errors
///
/// Returns [`IngestError::Serialization`] if `value` cannot be canonicalized.
pub fn canonical_hash(value: &serde_json::Value) -> Result<String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|e| IngestError::serialization(format!("failed to canonicalize: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Durable record of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMarker {
    /// Run signature.
    pub signature: ReplaySignature,
    /// Stage that ran.
    pub stage: Stage,
    /// What the run committed.
    pub summary: CommitSummary,
    /// When the marker was written.
    pub recorded_at: DateTime<Utc>,
    /// Ledger rows the run wrote; absent for Silver runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written: Option<BatchRows>,
}

impl ReplayMarker {
    /// Path of this marker.
    #[must_use]
    pub fn path(&self) -> String {
        self.signature.storage_path(self.stage)
    }
}

/// The rows one Bronze invocation wrote: its batch id within its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRows {
    /// Correlation id stamped on the rows.
    pub batch_id: BatchId,
    /// Partition the rows landed in.
    pub partition: PartitionSpec,
}

impl BatchRows {
    /// Predicate matching exactly these rows.
    #[must_use]
    pub fn scope(&self) -> RowPredicate {
        RowPredicate::All {
            predicates: vec![
                RowPredicate::Partition(self.partition.clone()),
                RowPredicate::column_equals(
                    columns::BATCH_ID,
                    serde_json::Value::String(self.batch_id.to_string()),
                ),
            ],
        }
    }
}

/// Reads and records replay markers.
pub struct ReplayController<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: ?Sized> std::fmt::Debug for ReplayController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayController").finish_non_exhaustive()
    }
}

impl<S> ReplayController<S>
where
    S: StorageBackend + ?Sized,
{
    /// Creates a controller over `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Loads the marker for `signature`, if a prior run recorded one.
    ///
    /// # Errors
    ///
    /// Returns the storage error, or a serialization error for a corrupt
    /// marker.
    pub async fn lookup(&self, stage: Stage, signature: &ReplaySignature) -> Result<Option<ReplayMarker>> {
        let loaded: Option<(ReplayMarker, String)> =
            self.storage.read_json(&signature.storage_path(stage)).await?;
        Ok(loaded.map(|(marker, _)| marker))
    }

    /// Records `marker`. A normal run claims the path (`DoesNotExist`); a
    /// forced replay overwrites it.
    ///
    /// Returns false when a concurrent run claimed the signature first; its
    /// marker is kept.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn record(&self, marker: &ReplayMarker, force: bool) -> Result<bool> {
        let precondition = if force {
            WritePrecondition::None
        } else {
            WritePrecondition::DoesNotExist
        };

        match self.storage.write_json(&marker.path(), marker, precondition).await? {
            WriteResult::Success { .. } => {
                tracing::debug!(
                    stage = %marker.stage,
                    signature = %marker.signature,
                    force,
                    "replay marker recorded"
                );
                Ok(true)
            }
            WriteResult::PreconditionFailed { .. } => {
                tracing::debug!(
                    stage = %marker.stage,
                    signature = %marker.signature,
                    "replay marker already present"
                );
                Ok(false)
            }
        }
    }
}
