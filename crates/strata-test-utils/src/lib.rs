//! Shared test utilities for Strata integration tests.
//!
//! This crate provides:
//! - [`FaultInjectingBackend`]: in-memory storage that records operations and
//!   can lose commit races, fail writes, or hold writers at a rendezvous
//! - Fixture helpers for building rows and timestamps
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_test_utils::{FaultInjectingBackend, record};
//!
//! let backend = std::sync::Arc::new(FaultInjectingBackend::new());
//! backend.reject_next_commits(2);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strata=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
