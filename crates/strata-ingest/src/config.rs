//! Ingestion configuration.
//!
//! Configuration is an explicit value built once by the caller and passed by
//! reference into the stage runners. Nothing here reads the environment.

use serde::{Deserialize, Serialize};
use strata_core::Redacted;

use crate::error::{IngestError, Result};

/// Lowest accepted commit retry ceiling.
pub const MIN_COMMIT_RETRIES: u32 = 3;
/// Highest accepted commit retry ceiling.
pub const MAX_COMMIT_RETRIES: u32 = 5;

/// Top-level ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// Commit attempts before a write fails as a conflict.
    pub max_commit_retries: u32,
    /// Bronze ledger table.
    pub bronze_table: String,
    /// Silver table of record.
    pub silver_table: String,
    /// Quarantine table for Bronze rejections.
    pub bronze_quarantine_table: String,
    /// Quarantine table for Silver rejections.
    pub silver_quarantine_table: String,
    /// Sanitization barrier settings.
    pub sanitization: SanitizationConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 4,
            bronze_table: "bronze".to_string(),
            silver_table: "silver".to_string(),
            bronze_quarantine_table: "bronze_quarantine".to_string(),
            silver_quarantine_table: "silver_quarantine".to_string(),
            sanitization: SanitizationConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if the retry ceiling is out of
    /// range, a table name is not `[a-z0-9_]+`, two roles share a table, or the
    /// sanitization limits are zero.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_COMMIT_RETRIES..=MAX_COMMIT_RETRIES).contains(&self.max_commit_retries) {
            return Err(IngestError::invalid_config(format!(
                "max_commit_retries must be between {MIN_COMMIT_RETRIES} and {MAX_COMMIT_RETRIES}, got {}",
                self.max_commit_retries
            )));
        }

        let tables = [
            ("bronze_table", &self.bronze_table),
            ("silver_table", &self.silver_table),
            ("bronze_quarantine_table", &self.bronze_quarantine_table),
            ("silver_quarantine_table", &self.silver_quarantine_table),
        ];
        for (field, name) in tables {
            if !is_valid_table_name(name) {
                return Err(IngestError::invalid_config(format!(
                    "{field} must match [a-z0-9_]+, got {name:?}"
                )));
            }
        }
        for (i, (field, name)) in tables.iter().enumerate() {
            if let Some((other, _)) = tables[i + 1..].iter().find(|(_, n)| n == name) {
                return Err(IngestError::invalid_config(format!(
                    "{field} and {other} must name different tables"
                )));
            }
        }

        self.sanitization.validate()
    }
}

/// Sanitization barrier settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SanitizationConfig {
    /// Salt prepended to values before one-way hashing.
    pub hash_salt: Option<Redacted<String>>,
    /// Token written in place of redacted values.
    pub redaction_token: String,
    /// Longest string value the barrier will scan.
    pub max_value_bytes: usize,
    /// Deepest object/array nesting the barrier will scan.
    pub max_depth: usize,
    /// Field names (case-insensitive) that are always redacted.
    pub sensitive_field_names: Vec<String>,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            hash_salt: None,
            redaction_token: "[REDACTED]".to_string(),
            max_value_bytes: 64 * 1024,
            max_depth: 16,
            sensitive_field_names: [
                "password",
                "passwd",
                "secret",
                "api_key",
                "apikey",
                "access_token",
                "refresh_token",
                "authorization",
                "ssn",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl std::fmt::Debug for SanitizationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanitizationConfig")
            .field("hash_salt", &self.hash_salt.as_ref().map(|_| "[REDACTED]"))
            .field("redaction_token", &self.redaction_token)
            .field("max_value_bytes", &self.max_value_bytes)
            .field("max_depth", &self.max_depth)
            .field("sensitive_field_names", &self.sensitive_field_names)
            .finish()
    }
}

impl SanitizationConfig {
    /// Sets the hashing salt.
    #[must_use]
    pub fn with_hash_salt(mut self, salt: impl Into<String>) -> Self {
        self.hash_salt = Some(Redacted(salt.into()));
        self
    }

    /// Validates barrier limits.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] for zero limits, an empty
    /// redaction token, or an empty salt.
    pub fn validate(&self) -> Result<()> {
        if self.max_value_bytes == 0 || self.max_depth == 0 {
            return Err(IngestError::invalid_config(
                "sanitization max_value_bytes and max_depth must be positive",
            ));
        }
        if self.redaction_token.is_empty() {
            return Err(IngestError::invalid_config(
                "sanitization redaction_token must not be empty",
            ));
        }
        if self
            .hash_salt
            .as_ref()
            .is_some_and(|salt| salt.expose().is_empty())
        {
            return Err(IngestError::invalid_config(
                "sanitization hash_salt must not be empty when set",
            ));
        }
        Ok(())
    }
}

pub(crate) fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
