//! Transactional table store for Strata.
//!
//! The ingestion core treats the table store as an external ACID collaborator
//! reached only through [`TableStore`]: read a snapshot, then commit an
//! operation against the version that was read. A commit against a stale
//! version comes back as [`CommitResult::Conflict`] and the caller retries.
//!
//! [`ObjectTableStore`] is the reference implementation on top of any
//! CAS-capable [`strata_core::StorageBackend`]:
//! - every commit writes an immutable snapshot `tables/{table}/_log/{version:020}.json`
//! - the `DoesNotExist` write of the next version is the commit point
//! - prior snapshots are retained for recovery and [`TableOperation::Restore`]
//!
//! Non-goals (for now):
//! - Columnar data files / statistics
//! - Snapshot expiry

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{Result, TableError};
pub use schema::{ColumnSpec, ColumnType, SchemaContract, SchemaDrift, SchemaEvolution};
pub use store::{ObjectTableStore, TableStore};
pub use types::{
    CommitResult, CommitStats, MatchCondition, OperationKind, PartitionSpec, Record,
    RowPredicate, TableCommit, TableOperation, TableSnapshot, columns, timestamp_of,
};
