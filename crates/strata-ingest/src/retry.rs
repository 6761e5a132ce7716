//! Optimistic commit loop shared by every writer in the core.
//!
//! Each attempt reads the latest snapshot, builds a commit against its
//! version, and submits it. A [`CommitResult::Conflict`] means another writer
//! landed first: the loop re-reads and rebuilds. The build closure may run
//! several times and must therefore be free of side effects.

use strata_table::{CommitResult, CommitStats, TableCommit, TableSnapshot, TableStore};

use crate::error::{IngestError, Result};
use crate::metrics::{record_commit_retry, record_write_conflict};

/// A commit that landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Landed {
    /// Committed version.
    pub version: i64,
    /// Row counts reported by the store.
    pub stats: CommitStats,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Commits to `table`, retrying conflicts up to `max_attempts` times.
pub(crate) async fn commit_with_retry<T, F>(
    store: &T,
    table: &str,
    max_attempts: u32,
    mut build: F,
) -> Result<Landed>
where
    T: TableStore + ?Sized,
    F: FnMut(&TableSnapshot) -> Result<TableCommit> + Send,
{
    for attempt in 1..=max_attempts {
        let snapshot = store.read_snapshot(table).await?;
        let commit = build(&snapshot)?;

        match store.commit(table, commit).await? {
            CommitResult::Committed { version, stats } => {
                tracing::debug!(table, version, attempt, "commit landed");
                return Ok(Landed {
                    version,
                    stats,
                    attempts: attempt,
                });
            }
            CommitResult::Conflict { current_version } => {
                tracing::debug!(
                    table,
                    attempt,
                    read_version = snapshot.version,
                    current_version,
                    "commit conflict; re-reading"
                );
                if attempt < max_attempts {
                    record_commit_retry(table);
                }
            }
        }
    }

    record_write_conflict(table);
    tracing::warn!(table, attempts = max_attempts, "commit retries exhausted");
    Err(IngestError::WriteConflict {
        table: table.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_core::MemoryBackend;
    use strata_table::ObjectTableStore;

    #[tokio::test]
    async fn lands_on_first_attempt_without_contention() {
        let store = ObjectTableStore::new(Arc::new(MemoryBackend::new()));
        let landed = commit_with_retry(&store, "t", 3, |snapshot| {
            Ok(TableCommit::append(snapshot.version, Vec::new()))
        })
        .await
        .expect("commit");
        assert_eq!(landed.version, 0);
        assert_eq!(landed.attempts, 1);
    }

    #[tokio::test]
    async fn stale_builds_exhaust_into_write_conflict() {
        let store = ObjectTableStore::new(Arc::new(MemoryBackend::new()));
        store
            .commit("t", TableCommit::append(-1, Vec::new()))
            .await
            .expect("seed");

        let mut builds = 0;
        let err = commit_with_retry(&store, "t", 3, |_| {
            builds += 1;
            Ok(TableCommit::append(-1, Vec::new()))
        })
        .await
        .expect_err("always stale");
        assert_eq!(builds, 3);
        assert!(matches!(err, IngestError::WriteConflict { attempts: 3, .. }));
    }
}
