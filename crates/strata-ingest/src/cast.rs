//! Type-cast gate at Silver ingress.
//!
//! Per row:
//! 1. the envelope must be present and parsable, else `missing_envelope`
//! 2. every declared column is cast to its contract type; a failed cast on a
//!    non-key column nulls the field and flags the row
//! 3. a row whose primary key is null after casting is dropped (it cannot be
//!    identified for review)
//! 4. quality rules run in order; the first failure sends the row to
//!    quarantine with both the original and the attempted cast
//!
//! Undeclared payload columns are not carried into Silver.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use strata_table::{ColumnSpec, ColumnType, Record};

use crate::contract::{QualityRule, SilverContract};
use crate::envelope::{Envelope, format_timestamp};
use crate::error::{IngestError, RejectReason, Result};
use crate::quarantine::QuarantineEntry;

/// A field nulled by a failed cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastFlag {
    /// Column that failed to cast.
    pub column: String,
    /// Value before casting.
    pub original: Value,
    /// Declared type.
    pub target: ColumnType,
    /// Why the cast failed.
    pub message: String,
}

/// Gate output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CastOutcome {
    /// Typed rows ready for merge.
    pub clean: Vec<Record>,
    /// Rows that failed the envelope check or a quality rule.
    pub quarantined: Vec<QuarantineEntry>,
    /// Rows dropped for a null primary key.
    pub dropped: usize,
    /// Clean rows with at least one nulled field.
    pub flagged: usize,
    /// Nulled fields of the clean rows.
    pub flags: Vec<CastFlag>,
}

#[derive(Debug)]
enum CompiledRule {
    Range {
        column: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Pattern {
        column: String,
        regex: Regex,
    },
    AllowedValues {
        column: String,
        values: Vec<Value>,
    },
    NotNull {
        column: String,
    },
}

impl CompiledRule {
    fn compile(rule: &QualityRule) -> Result<Self> {
        Ok(match rule {
            QualityRule::Range { column, min, max } => Self::Range {
                column: column.clone(),
                min: *min,
                max: *max,
            },
            QualityRule::Pattern { column, regex } => Self::Pattern {
                column: column.clone(),
                regex: Regex::new(regex).map_err(|e| {
                    IngestError::invalid_config(format!("invalid pattern for `{column}`: {e}"))
                })?,
            },
            QualityRule::AllowedValues { column, values } => Self::AllowedValues {
                column: column.clone(),
                values: values.clone(),
            },
            QualityRule::NotNull { column } => Self::NotNull {
                column: column.clone(),
            },
        })
    }

    /// Returns the failure reason and detail, or `None` if the row passes.
    fn check(&self, row: &Record) -> Option<(RejectReason, String)> {
        let value = |column: &str| row.get(column).filter(|v| !v.is_null());

        match self {
            Self::NotNull { column } => value(column)
                .is_none()
                .then(|| (RejectReason::NotNullFailed, format!("`{column}` is null"))),
            Self::Range { column, min, max } => {
                let v = value(column)?;
                let Some(n) = v.as_f64() else {
                    return Some((
                        RejectReason::RangeCheckFailed,
                        format!("`{column}` is not numeric"),
                    ));
                };
                if let Some(min) = min.filter(|min| n < *min) {
                    return Some((
                        RejectReason::RangeCheckFailed,
                        format!("`{column}` = {n} is below {min}"),
                    ));
                }
                max.filter(|max| n > *max).map(|max| {
                    (
                        RejectReason::RangeCheckFailed,
                        format!("`{column}` = {n} is above {max}"),
                    )
                })
            }
            Self::Pattern { column, regex } => {
                let v = value(column)?;
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (!regex.is_match(&text)).then(|| {
                    (
                        RejectReason::PatternCheckFailed,
                        format!("`{column}` does not match {}", regex.as_str()),
                    )
                })
            }
            Self::AllowedValues { column, values } => {
                let v = value(column)?;
                (!values.contains(v)).then(|| {
                    (
                        RejectReason::ReferenceCheckFailed,
                        format!("`{column}` is not in the reference set"),
                    )
                })
            }
        }
    }
}

/// Casts, validates, and splits rows at Silver ingress.
#[derive(Debug)]
pub struct TypeCastGate {
    columns: Vec<ColumnSpec>,
    primary_key: Vec<String>,
    rules: Vec<CompiledRule>,
}

impl TypeCastGate {
    /// Builds a gate for `contract`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if the contract is inconsistent
    /// or a pattern does not compile.
    pub fn new(contract: &SilverContract) -> Result<Self> {
        contract.validate()?;
        Ok(Self {
            columns: contract.schema.columns.clone(),
            primary_key: contract.primary_key.clone(),
            rules: contract
                .rules
                .iter()
                .map(CompiledRule::compile)
                .collect::<Result<_>>()?,
        })
    }

    /// Runs the gate over Bronze rows.
    #[must_use]
    pub fn apply(&self, rows: Vec<Record>) -> CastOutcome {
        let mut outcome = CastOutcome::default();

        for row in rows {
            let Some(envelope) = Envelope::from_row(&row) else {
                outcome.quarantined.push(QuarantineEntry::new(
                    row,
                    None,
                    RejectReason::MissingEnvelope,
                    "envelope columns missing or unparsable",
                ));
                continue;
            };

            let (mut cast, flags) = self.cast_row(&row);
            for (name, value) in envelope.columns() {
                cast.insert(name.to_string(), value);
            }

            if self
                .primary_key
                .iter()
                .any(|key| cast.get(key).is_none_or(Value::is_null))
            {
                tracing::debug!(batch_id = %envelope.batch_id, "row dropped: null primary key");
                outcome.dropped += 1;
                continue;
            }

            if let Some((reason, detail)) = self.rules.iter().find_map(|rule| rule.check(&cast)) {
                outcome
                    .quarantined
                    .push(QuarantineEntry::new(row, Some(cast), reason, detail));
                continue;
            }

            if !flags.is_empty() {
                outcome.flagged += 1;
                outcome.flags.extend(flags);
            }
            outcome.clean.push(cast);
        }

        outcome
    }

    fn cast_row(&self, row: &Record) -> (Record, Vec<CastFlag>) {
        let mut cast = Record::new();
        let mut flags = Vec::new();

        for spec in &self.columns {
            let original = row.get(&spec.name).cloned().unwrap_or(Value::Null);
            let value = match cast_value(&original, spec.data_type) {
                Ok(value) => value,
                Err(message) => {
                    flags.push(CastFlag {
                        column: spec.name.clone(),
                        original,
                        target: spec.data_type,
                        message,
                    });
                    Value::Null
                }
            };
            cast.insert(spec.name.clone(), value);
        }

        (cast, flags)
    }
}

/// Casts one value to `target`. `null` casts to `null`.
///
/// # Errors
///
/// Returns a description of why the value cannot be represented as `target`.
pub fn cast_value(value: &Value, target: ColumnType) -> std::result::Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match target {
        ColumnType::Json => Ok(value.clone()),
        ColumnType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("nested value cannot be cast to string".to_string()),
        },
        ColumnType::Integer => cast_integer(value).map(Value::from),
        ColumnType::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("{} is not a number", kind(value)))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| "non-finite number".to_string())
        }
        ColumnType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err("string is not a boolean".to_string()),
            },
            _ => Err(format!("{} is not a boolean", kind(value))),
        },
        ColumnType::Timestamp => {
            let text = value.as_str().ok_or("timestamp must be a string")?;
            DateTime::parse_from_rfc3339(text.trim())
                .map(|ts| Value::String(format_timestamp(ts.with_timezone(&Utc))))
                .map_err(|e| format!("invalid RFC 3339 timestamp: {e}"))
        }
        ColumnType::Date => {
            let text = value.as_str().ok_or("date must be a string")?;
            NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|e| format!("invalid date: {e}"))
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cast_integer(value: &Value) -> std::result::Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f)
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
                {
                    Ok(f as i64)
                }
                _ => Err(format!("{n} is not a 64-bit integer")),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| "string is not an integer".to_string()),
        other => Err(format!("{} is not an integer", kind(other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
