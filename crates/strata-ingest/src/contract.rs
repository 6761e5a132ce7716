//! Silver contracts: locked schema, primary key, and row-level quality rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_table::{ColumnSpec, ColumnType, SchemaContract, SchemaEvolution, columns};

use crate::error::{IngestError, Result};

/// A row-level quality rule evaluated after casting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum QualityRule {
    /// Numeric value within `[min, max]` (either bound optional).
    Range {
        /// Column checked.
        column: String,
        /// Inclusive lower bound.
        #[serde(default)]
        min: Option<f64>,
        /// Inclusive upper bound.
        #[serde(default)]
        max: Option<f64>,
    },
    /// Value text matches a regex.
    Pattern {
        /// Column checked.
        column: String,
        /// Regex (unanchored unless written with `^`/`$`).
        regex: String,
    },
    /// Value is one of a reference set.
    AllowedValues {
        /// Column checked.
        column: String,
        /// Permitted values.
        values: Vec<Value>,
    },
    /// Value is not null.
    NotNull {
        /// Column checked.
        column: String,
    },
}

impl QualityRule {
    /// Column the rule checks.
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Range { column, .. }
            | Self::Pattern { column, .. }
            | Self::AllowedValues { column, .. }
            | Self::NotNull { column } => column,
        }
    }
}

/// Everything the Silver stage needs to know about its target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverContract {
    /// Locked schema of the Silver table.
    pub schema: SchemaContract,
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// Quality rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<QualityRule>,
}

impl SilverContract {
    /// Creates a contract at `version` over `columns`.
    #[must_use]
    pub fn new(version: u32, columns: Vec<ColumnSpec>, primary_key: Vec<String>) -> Self {
        Self {
            schema: SchemaContract::locked(version, columns),
            primary_key,
            rules: Vec::new(),
        }
    }

    /// Appends a quality rule.
    #[must_use]
    pub fn with_rule(mut self, rule: QualityRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validates internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if the schema is not locked, the
    /// primary key is empty or undeclared, a column is declared twice or
    /// shadows an envelope column, or a rule names an undeclared column.
    pub fn validate(&self) -> Result<()> {
        if self.schema.evolution != SchemaEvolution::Locked {
            return Err(IngestError::invalid_config("silver schema must be locked"));
        }
        if self.primary_key.is_empty() {
            return Err(IngestError::invalid_config(
                "silver contract requires a primary key",
            ));
        }

        for (i, spec) in self.schema.columns.iter().enumerate() {
            if columns::ENVELOPE.contains(&spec.name.as_str()) {
                return Err(IngestError::invalid_config(format!(
                    "column `{}` is reserved for the envelope",
                    spec.name
                )));
            }
            if self.schema.columns[..i].iter().any(|c| c.name == spec.name) {
                return Err(IngestError::invalid_config(format!(
                    "column `{}` is declared twice",
                    spec.name
                )));
            }
        }

        let declared = |name: &str| self.schema.column(name).is_some();
        if let Some(key) = self.primary_key.iter().find(|k| !declared(k)) {
            return Err(IngestError::invalid_config(format!(
                "primary key column `{key}` is not declared"
            )));
        }
        if let Some(rule) = self.rules.iter().find(|r| !declared(r.column())) {
            return Err(IngestError::invalid_config(format!(
                "quality rule references undeclared column `{}`",
                rule.column()
            )));
        }
        Ok(())
    }

    /// Schema actually stored on the Silver table: declared columns followed
    /// by the envelope columns every row carries.
    #[must_use]
    pub fn table_schema(&self) -> SchemaContract {
        let mut stored = self.schema.clone();
        stored.columns.extend([
            ColumnSpec::new(columns::INGEST_TIMESTAMP, ColumnType::Timestamp),
            ColumnSpec::new(columns::SOURCE_SYSTEM, ColumnType::String),
            ColumnSpec::new(columns::BATCH_ID, ColumnType::String),
            ColumnSpec::new(columns::INGEST_DATE, ColumnType::Date),
        ]);
        stored
    }
}
