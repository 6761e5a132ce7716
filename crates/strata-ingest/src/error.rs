//! Error types for the ingestion core.
//!
//! Two tiers:
//! - [`IngestError`] aborts the current stage (schema drift, exhausted write
//!   conflicts, infrastructure failures) and is surfaced to the orchestrator.
//! - [`RejectReason`] describes a single record that was set aside. Rejections
//!   are data, not errors: they land in a quarantine table and the batch
//!   continues.

use serde::{Deserialize, Serialize};
use strata_table::{ColumnType, TableError};

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Stage-level failures.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// An existing column's declared type would change.
    #[error("schema drift on {table}: column `{column}` is {existing}, batch carries {incoming}")]
    SchemaDriftViolation {
        /// Target table.
        table: String,
        /// Column whose type would change.
        column: String,
        /// Declared type.
        existing: ColumnType,
        /// Incoming type.
        incoming: ColumnType,
    },

    /// Optimistic commit retries were exhausted.
    #[error("write conflict on {table}: gave up after {attempts} attempts")]
    WriteConflict {
        /// Target table.
        table: String,
        /// Number of commit attempts made.
        attempts: u32,
    },

    /// The stored Silver contract differs from the one supplied to the stage.
    #[error("contract mismatch on {table}: {message}")]
    ContractMismatch {
        /// Target table.
        table: String,
        /// What differs.
        message: String,
    },

    /// Configuration (or a Silver contract) failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// The source batch cannot be ingested as given.
    #[error("invalid batch: {message}")]
    InvalidBatch {
        /// What is wrong.
        message: String,
    },

    /// The table store rejected an operation.
    #[error(transparent)]
    Table(#[from] TableError),

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] strata_core::Error),

    /// Failed to encode or canonicalize a value.
    #[error("serialization error: {message}")]
    Serialization {
        /// Details.
        message: String,
    },
}

impl IngestError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid batch error.
    #[must_use]
    pub fn invalid_batch(message: impl Into<String>) -> Self {
        Self::InvalidBatch {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the stable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaDriftViolation { .. } => ErrorKind::SchemaDriftViolation,
            Self::WriteConflict { .. } => ErrorKind::WriteConflict,
            Self::ContractMismatch { .. } => ErrorKind::ContractMismatch,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::InvalidBatch { .. } => ErrorKind::InvalidBatch,
            Self::Table(_) => ErrorKind::Table,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization { .. } => ErrorKind::Serialization,
        }
    }
}

/// Stable error kinds reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`IngestError::SchemaDriftViolation`].
    SchemaDriftViolation,
    /// See [`IngestError::WriteConflict`].
    WriteConflict,
    /// See [`IngestError::ContractMismatch`].
    ContractMismatch,
    /// See [`IngestError::InvalidConfig`].
    InvalidConfig,
    /// See [`IngestError::InvalidBatch`].
    InvalidBatch,
    /// See [`IngestError::Table`].
    Table,
    /// See [`IngestError::Storage`].
    Storage,
    /// See [`IngestError::Serialization`].
    Serialization,
}

impl ErrorKind {
    /// Returns the kind as a snake_case string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaDriftViolation => "schema_drift_violation",
            Self::WriteConflict => "write_conflict",
            Self::ContractMismatch => "contract_mismatch",
            Self::InvalidConfig => "invalid_config",
            Self::InvalidBatch => "invalid_batch",
            Self::Table => "table",
            Self::Storage => "storage",
            Self::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record was routed to quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A field could not be confidently masked.
    SanitizationFailed,
    /// The batch would have changed an existing column type.
    SchemaDrift,
    /// A numeric value fell outside its declared range.
    RangeCheckFailed,
    /// A value did not match its declared pattern.
    PatternCheckFailed,
    /// A value was not in its reference set.
    ReferenceCheckFailed,
    /// A required value was null.
    NotNullFailed,
    /// Envelope columns were missing or unparsable.
    MissingEnvelope,
}

impl RejectReason {
    /// Returns the reason as stored in the `error_reason` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SanitizationFailed => "sanitization_failed",
            Self::SchemaDrift => "schema_drift",
            Self::RangeCheckFailed => "range_check_failed",
            Self::PatternCheckFailed => "pattern_check_failed",
            Self::ReferenceCheckFailed => "reference_check_failed",
            Self::NotNullFailed => "not_null_failed",
            Self::MissingEnvelope => "missing_envelope",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
