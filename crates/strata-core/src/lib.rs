//! # strata-core
//!
//! Shared primitives for the Strata ingestion-and-refinement pipeline.
//!
//! - **Errors**: the shared [`Error`] type and [`Result`] alias
//! - **Storage**: a CAS-capable object storage contract ([`StorageBackend`])
//!   with an in-memory backend and JSON helpers
//! - **Observability**: logging initialization, span helpers, and a
//!   [`Redacted`] wrapper for values that must never reach a log line
//!
//! ## Crate Boundary
//!
//! Higher layers (`strata-table`, `strata-ingest`) only talk to storage through
//! the contract defined here. Nothing in this crate reads the environment
//! except [`init_logging`], which honours `RUST_LOG` at process start.
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let _ = backend;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::observability::{LogFormat, LoggingConfig, Redacted, init_logging, stage_span};
    pub use crate::storage::{
        JsonStore, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use observability::{LogFormat, LoggingConfig, Redacted, init_logging, stage_span};
pub use storage::{
    JsonStore, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
