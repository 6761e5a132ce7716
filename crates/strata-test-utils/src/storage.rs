//! Test storage with operation tracing and fault injection.
//!
//! Wraps [`MemoryBackend`] and records every operation so tests can assert on
//! what reached storage. Faults cover the failure modes the ingestion core
//! must survive:
//! - losing a commit race ([`FaultInjectingBackend::reject_next_commits`])
//! - transient write errors ([`FaultInjectingBackend::fail_puts_under`])
//! - two writers reaching the same commit point together
//!   ([`FaultInjectingBackend::rendezvous_commits`])

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::error::{Error, Result};
use strata_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
use tokio::sync::Barrier;

/// Marker for table commit-log objects.
const LOG_SEGMENT: &str = "/_log/";

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

#[derive(Debug)]
struct Rendezvous {
    prefix: String,
    remaining: AtomicUsize,
    barrier: Arc<Barrier>,
}

/// In-memory storage backend with tracing and fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultInjectingBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    rejected_commits: Arc<AtomicUsize>,
    rendezvous: Arc<Mutex<Option<Rendezvous>>>,
    latency: Option<Duration>,
}

impl FaultInjectingBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with simulated latency on every operation.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Makes the next `count` commit-log writes report a lost race.
    ///
    /// The rejected snapshot is not stored, so the table version does not
    /// move; the writer sees a conflict and must re-read and retry.
    pub fn reject_next_commits(&self, count: usize) {
        self.rejected_commits.store(count, Ordering::SeqCst);
    }

    /// Number of injected commit rejections not yet consumed.
    #[must_use]
    pub fn pending_rejections(&self) -> usize {
        self.rejected_commits.load(Ordering::SeqCst)
    }

    /// Fails every put whose path starts with `prefix`.
    pub fn fail_puts_under(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected put failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    /// Holds the first `parties` commit-log writes under `prefix` until all of
    /// them have arrived, then releases them together.
    pub fn rendezvous_commits(&self, prefix: impl Into<String>, parties: usize) {
        *self.rendezvous.lock().expect("lock") = Some(Rendezvous {
            prefix: prefix.into(),
            remaining: AtomicUsize::new(parties),
            barrier: Arc::new(Barrier::new(parties)),
        });
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded puts whose path starts with `prefix`.
    #[must_use]
    pub fn puts_under(&self, prefix: &str) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| matches!(op, StorageOp::Put { path, .. } if path.starts_with(prefix)))
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Returns all stored paths under `prefix`, sorted.
    pub async fn paths(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list(prefix)
            .await
            .expect("list")
            .into_iter()
            .map(|meta| meta.path)
            .collect();
        paths.sort();
        paths
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.starts_with(p)) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }

    fn take_rejection(&self, path: &str, precondition: &WritePrecondition) -> bool {
        is_commit_point(path, precondition)
            && self
                .rejected_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }

    async fn maybe_rendezvous(&self, path: &str, precondition: &WritePrecondition) {
        if !is_commit_point(path, precondition) {
            return;
        }
        let barrier = {
            let guard = self.rendezvous.lock().expect("lock");
            guard
                .as_ref()
                .filter(|r| path.starts_with(&r.prefix))
                .filter(|r| {
                    r.remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                })
                .map(|r| Arc::clone(&r.barrier))
        };
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn is_commit_point(path: &str, precondition: &WritePrecondition) -> bool {
    path.contains(LOG_SEGMENT) && *precondition == WritePrecondition::DoesNotExist
}

#[async_trait]
impl StorageBackend for FaultInjectingBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.check_failure(path)?;

        if self.take_rejection(path, &precondition) {
            return Ok(WriteResult::PreconditionFailed {
                current_version: "1".to_string(),
            });
        }
        self.maybe_rendezvous(path, &precondition).await;

        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }
}
