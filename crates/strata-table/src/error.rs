//! Error types for `strata-table`.

/// Result type for table store operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Table store errors.
///
/// A concurrent writer winning the race is not an error: it is reported as
/// [`crate::CommitResult::Conflict`] so callers can re-read and retry.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Invalid input from a caller.
    #[error("bad request: {message}")]
    BadRequest {
        /// Human-readable error details.
        message: String,
    },

    /// A schema contract change was not an allowed evolution or migration.
    #[error("contract change rejected for {table}: {message}")]
    ContractMigration {
        /// Table whose contract was being replaced.
        table: String,
        /// Why the change was rejected.
        message: String,
    },

    /// A retained snapshot referenced by the caller does not exist.
    #[error("snapshot not found: {table}@{version}")]
    SnapshotNotFound {
        /// Table name.
        table: String,
        /// Requested version.
        version: i64,
    },

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] strata_core::Error),

    /// Failed to serialize/deserialize snapshot state.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable serialization details.
        message: String,
    },
}

impl TableError {
    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a contract migration error.
    #[must_use]
    pub fn contract_migration(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContractMigration {
            table: table.into(),
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
