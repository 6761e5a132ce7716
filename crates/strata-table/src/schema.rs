//! Schema contracts.
//!
//! A [`SchemaContract`] declares the column set and types of a table.
//! - `Additive` contracts (Bronze) may gain columns but never change the type
//!   of an existing column.
//! - `Locked` contracts (Silver) change only through an explicit migration to
//!   a higher contract version.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Record;

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// UTC timestamp, stored as RFC 3339 text.
    Timestamp,
    /// Calendar date, stored as `YYYY-MM-DD`.
    Date,
    /// Nested object or array (Bronze only).
    Json,
}

impl ColumnType {
    /// Returns the type name as used in contracts and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Json => "json",
        }
    }

    /// Infers the type of a raw JSON value. `null` carries no type.
    #[must_use]
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Integer),
            Value::Number(_) => Some(Self::Float),
            Value::String(_) => Some(Self::String),
            Value::Array(_) | Value::Object(_) => Some(Self::Json),
        }
    }

    /// Returns true if values of `incoming` type can be stored in a column of
    /// this type without changing its declared type.
    #[must_use]
    pub fn accepts(self, incoming: Self) -> bool {
        self == incoming || (self == Self::Float && incoming == Self::Integer)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub data_type: ColumnType,
}

impl ColumnSpec {
    /// Creates a column spec.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// How a contract is allowed to change over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaEvolution {
    /// New columns may be added; existing types are frozen.
    Additive,
    /// Any change requires a higher contract version.
    Locked,
}

/// An existing column's type would change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("column `{column}` is declared {existing} but batch carries {incoming}")]
pub struct SchemaDrift {
    /// Column whose type would change.
    pub column: String,
    /// Currently declared type.
    pub existing: ColumnType,
    /// Type observed in the incoming batch.
    pub incoming: ColumnType,
}

/// Declared column set/types for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Contract version; bumped by explicit migrations.
    pub version: u32,
    /// Evolution policy.
    pub evolution: SchemaEvolution,
    /// Declared columns in declaration order.
    pub columns: Vec<ColumnSpec>,
}

impl SchemaContract {
    /// Creates an additive (Bronze) contract at version 1.
    #[must_use]
    pub fn additive(columns: Vec<ColumnSpec>) -> Self {
        Self {
            version: 1,
            evolution: SchemaEvolution::Additive,
            columns,
        }
    }

    /// Creates a locked (Silver) contract.
    #[must_use]
    pub fn locked(version: u32, columns: Vec<ColumnSpec>) -> Self {
        Self {
            version,
            evolution: SchemaEvolution::Locked,
            columns,
        }
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Infers an additive contract from a batch of raw rows.
    ///
    /// Columns appear in first-seen order. Integer and float observations of
    /// the same column widen to float.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaDrift`] if the batch itself disagrees on a column type.
    pub fn infer(rows: &[Record]) -> Result<Self, SchemaDrift> {
        let mut columns: Vec<ColumnSpec> = Vec::new();

        for row in rows {
            for (name, value) in row {
                let Some(observed) = ColumnType::infer(value) else {
                    continue;
                };
                match columns.iter_mut().find(|c| &c.name == name) {
                    None => columns.push(ColumnSpec::new(name.clone(), observed)),
                    Some(spec) if spec.data_type.accepts(observed) => {}
                    Some(spec) if observed.accepts(spec.data_type) => spec.data_type = observed,
                    Some(spec) => {
                        return Err(SchemaDrift {
                            column: name.clone(),
                            existing: spec.data_type,
                            incoming: observed,
                        });
                    }
                }
            }
        }

        Ok(Self::additive(columns))
    }

    /// Merges `incoming` columns into this contract.
    ///
    /// New columns are appended. An integer column receiving floats widens to
    /// float, matching [`SchemaContract::infer`]; any other type change is
    /// drift.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaDrift`] for the first column whose declared type would change.
    pub fn evolve(&self, incoming: &Self) -> Result<Self, SchemaDrift> {
        let mut merged = self.clone();
        for spec in &incoming.columns {
            match merged.columns.iter_mut().find(|c| c.name == spec.name) {
                None => merged.columns.push(spec.clone()),
                Some(existing) if existing.data_type.accepts(spec.data_type) => {}
                Some(existing) if spec.data_type.accepts(existing.data_type) => {
                    existing.data_type = spec.data_type;
                }
                Some(existing) => {
                    return Err(SchemaDrift {
                        column: spec.name.clone(),
                        existing: existing.data_type,
                        incoming: spec.data_type,
                    });
                }
            }
        }
        Ok(merged)
    }

    /// Checks whether `next` may replace this contract.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the replacement is not allowed.
    pub fn check_replacement(&self, next: &Self) -> Result<(), String> {
        if self == next {
            return Ok(());
        }

        match self.evolution {
            SchemaEvolution::Additive => {
                for existing in &self.columns {
                    match next.column(&existing.name) {
                        None => {
                            return Err(format!(
                                "additive contract cannot drop column `{}`",
                                existing.name
                            ));
                        }
                        Some(spec) if !spec.data_type.accepts(existing.data_type) => {
                            return Err(format!(
                                "additive contract cannot change `{}` from {} to {}",
                                existing.name, existing.data_type, spec.data_type
                            ));
                        }
                        Some(_) => {}
                    }
                }
                Ok(())
            }
            SchemaEvolution::Locked if next.version > self.version => Ok(()),
            SchemaEvolution::Locked => Err(format!(
                "locked contract v{} changes only via migration to a higher version (got v{})",
                self.version, next.version
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn infer_widens_integer_to_float() {
        let rows = vec![
            record(json!({"price": 10, "name": "a"})),
            record(json!({"price": 10.5, "name": null})),
        ];
        let contract = SchemaContract::infer(&rows).expect("infer");
        assert_eq!(
            contract.column("price").map(|c| c.data_type),
            Some(ColumnType::Float)
        );
        assert_eq!(
            contract.column("name").map(|c| c.data_type),
            Some(ColumnType::String)
        );
    }

    #[test]
    fn infer_rejects_conflicting_types_within_batch() {
        let rows = vec![record(json!({"qty": 1})), record(json!({"qty": "one"}))];
        let drift = SchemaContract::infer(&rows).expect_err("drift");
        assert_eq!(drift.column, "qty");
        assert_eq!(drift.existing, ColumnType::Integer);
        assert_eq!(drift.incoming, ColumnType::String);
    }

    #[test]
    fn evolve_adds_columns_and_detects_drift() {
        let base = SchemaContract::additive(vec![ColumnSpec::new("id", ColumnType::Integer)]);
        let wider = SchemaContract::additive(vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("note", ColumnType::String),
        ]);
        let merged = base.evolve(&wider).expect("additive");
        assert_eq!(merged.columns.len(), 2);

        let drifted = SchemaContract::additive(vec![ColumnSpec::new("id", ColumnType::String)]);
        let drift = base.evolve(&drifted).expect_err("drift");
        assert_eq!(drift.to_string(), "column `id` is declared integer but batch carries string");
    }

    #[test]
    fn evolve_widens_integer_to_float_across_batches() {
        let first = SchemaContract::infer(&[record(json!({"price": 10}))]).expect("first");
        let second = SchemaContract::infer(&[record(json!({"price": 10.5}))]).expect("second");

        let merged = first.evolve(&second).expect("integer widens to float");
        assert_eq!(
            merged.column("price").map(|c| c.data_type),
            Some(ColumnType::Float)
        );
        assert!(first.check_replacement(&merged).is_ok());

        // Float never narrows back to integer.
        let again = merged.evolve(&first).expect("integer fits float");
        assert_eq!(again, merged);
        assert!(merged.check_replacement(&first).is_err());
    }

    #[test]
    fn locked_contract_requires_version_bump() {
        let v1 = SchemaContract::locked(1, vec![ColumnSpec::new("id", ColumnType::Integer)]);
        let mut changed = v1.clone();
        changed.columns.push(ColumnSpec::new("price", ColumnType::Float));
        assert!(v1.check_replacement(&changed).is_err());

        changed.version = 2;
        assert!(v1.check_replacement(&changed).is_ok());
        assert!(v1.check_replacement(&v1).is_ok());
    }

    #[test]
    fn additive_contract_cannot_drop_columns() {
        let base = SchemaContract::additive(vec![
            ColumnSpec::new("id", ColumnType::Integer),
            ColumnSpec::new("note", ColumnType::String),
        ]);
        let narrower = SchemaContract::additive(vec![ColumnSpec::new("id", ColumnType::Integer)]);
        assert!(base.check_replacement(&narrower).is_err());
    }
}
