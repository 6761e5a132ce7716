//! # strata-ingest
//!
//! The ingestion-merge core: raw source batches become an immutable, sanitized
//! Bronze ledger, and Bronze partitions are typed, validated and merged into a
//! deduplicated Silver table of record.
//!
//! ## Components
//!
//! - [`SanitizationBarrier`]: masks sensitive fields before anything is
//!   persisted; records it cannot mask are quarantined
//! - [`Envelope`]: provenance columns stamped on every Bronze row
//! - [`AppendOnlyLedger`]: drift-aware append into Bronze; a forced replay
//!   replaces only the rows of the run it repeats
//! - [`TypeCastGate`]: casts to the Silver contract and applies quality rules
//! - [`MergeEngine`]: key-based upsert where only strictly newer rows win
//! - [`QuarantineRouter`]: append-only dead-letter tables per stage
//! - [`ReplayController`]: short-circuits runs whose signature is recorded
//!
//! [`BronzeStage`] and [`SilverStage`] wire these together. All table writes
//! use optimistic concurrency: a conflicting commit re-reads the latest
//! snapshot and retries up to [`IngestConfig::max_commit_retries`] times.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use strata_core::MemoryBackend;
//! use strata_ingest::{BronzeStage, IngestConfig, RunOptions, SanitizationBarrier, SourceBatch};
//! use strata_table::ObjectTableStore;
//!
//! # async fn example() -> strata_ingest::Result<()> {
//! let storage = Arc::new(MemoryBackend::new());
//! let store = Arc::new(ObjectTableStore::new(Arc::clone(&storage)));
//! let config = IngestConfig::default();
//! let barrier = SanitizationBarrier::with_default_rules(&config.sanitization);
//!
//! let bronze = BronzeStage::new(&config, barrier, store, storage)?;
//! let outcome = bronze
//!     .run(SourceBatch::new("shop", Vec::new()), RunOptions::default(), Utc::now())
//!     .await?;
//! println!("{:?}", outcome.summary());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cast;
pub mod config;
pub mod contract;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod quarantine;
pub mod replay;
mod retry;
pub mod sanitize;
pub mod types;

pub use cast::{CastFlag, CastOutcome, TypeCastGate, cast_value};
pub use config::{IngestConfig, SanitizationConfig};
pub use contract::{QualityRule, SilverContract};
pub use envelope::{BatchId, Envelope};
pub use error::{ErrorKind, IngestError, RejectReason, Result};
pub use ledger::{AppendOnlyLedger, LedgerCommit, WriteMode};
pub use merge::{MergeEngine, MergeReport};
pub use pipeline::{BronzeStage, SilverStage};
pub use quarantine::{PurgeRequest, QuarantineEntry, QuarantineRouter};
pub use replay::{ReplayController, ReplayMarker, ReplaySignature};
pub use sanitize::{
    Detector, FieldDetector, MaskingPolicy, MaskingRule, SanitizationBarrier, SanitizedBatch,
};
pub use types::{BatchWindow, CommitSummary, RunOptions, SourceBatch, Stage, StageOutcome};
