//! Provenance envelope stamped onto every ingested row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_table::{PartitionSpec, Record, columns, types::timestamp_of};
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Correlation id of one stage invocation (`UUIDv7`, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Generates a new batch id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for BatchId {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IngestError::invalid_batch(format!("invalid batch id {s:?}: {e}")))
    }
}

/// Provenance columns shared by every row of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Time of ingestion; read once per invocation.
    pub ingest_timestamp: DateTime<Utc>,
    /// Batch correlation id.
    pub batch_id: BatchId,
    /// Originating source system.
    pub source_system: String,
    /// Partition date (UTC date of `ingest_timestamp`).
    pub ingest_date: NaiveDate,
}

impl Envelope {
    /// Captures the envelope for one invocation.
    #[must_use]
    pub fn capture(source_system: impl Into<String>, batch_id: BatchId, now: DateTime<Utc>) -> Self {
        Self {
            ingest_timestamp: now,
            batch_id,
            source_system: source_system.into(),
            ingest_date: now.date_naive(),
        }
    }

    /// Partition the stamped rows belong to.
    #[must_use]
    pub fn partition(&self) -> PartitionSpec {
        PartitionSpec::new(self.source_system.clone(), self.ingest_date)
    }

    /// Envelope columns as `(name, value)` pairs in persisted order.
    #[must_use]
    pub fn columns(&self) -> [(&'static str, Value); 4] {
        [
            (
                columns::INGEST_TIMESTAMP,
                Value::String(format_timestamp(self.ingest_timestamp)),
            ),
            (
                columns::SOURCE_SYSTEM,
                Value::String(self.source_system.clone()),
            ),
            (columns::BATCH_ID, Value::String(self.batch_id.to_string())),
            (
                columns::INGEST_DATE,
                Value::String(self.ingest_date.format("%Y-%m-%d").to_string()),
            ),
        ]
    }

    /// Stamps one record. Envelope columns replace same-named payload fields.
    #[must_use]
    pub fn stamp_record(&self, mut record: Record) -> Record {
        for (name, value) in self.columns() {
            if let Some(previous) = record.insert(name.to_string(), value) {
                if !previous.is_null() {
                    tracing::warn!(
                        column = name,
                        batch_id = %self.batch_id,
                        "payload field overwritten by envelope column"
                    );
                }
            }
        }
        record
    }

    /// Stamps every record of a batch with this envelope.
    #[must_use]
    pub fn stamp(&self, records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .map(|record| self.stamp_record(record))
            .collect()
    }

    /// Reads the envelope back from a persisted row.
    ///
    /// Returns `None` if any envelope column is missing or unparsable.
    #[must_use]
    pub fn from_row(row: &Record) -> Option<Self> {
        let ingest_timestamp = timestamp_of(row, columns::INGEST_TIMESTAMP)?;
        let source_system = row.get(columns::SOURCE_SYSTEM)?.as_str()?.to_string();
        let batch_id = row.get(columns::BATCH_ID)?.as_str()?.parse().ok()?;
        let ingest_date =
            NaiveDate::parse_from_str(row.get(columns::INGEST_DATE)?.as_str()?, "%Y-%m-%d").ok()?;
        Some(Self {
            ingest_timestamp,
            batch_id,
            source_system,
            ingest_date,
        })
    }
}

/// Stamps `records` with a fresh envelope for `source_system`.
#[must_use]
pub fn stamp(
    records: Vec<Record>,
    source_system: &str,
    batch_id: BatchId,
    now: DateTime<Utc>,
) -> Vec<Record> {
    Envelope::capture(source_system, batch_id, now).stamp(records)
}

/// Formats a timestamp the way envelope and cast columns persist it: UTC,
/// RFC 3339, microsecond precision.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 30)
            .single()
            .expect("timestamp")
    }

    #[test]
    fn whole_batch_shares_one_envelope() {
        let batch_id = BatchId::generate();
        let rows = stamp(
            vec![record(json!({"id": 1})), record(json!({"id": 2}))],
            "crm",
            batch_id,
            now(),
        );

        for row in &rows {
            assert_eq!(row["ingest_timestamp"], json!("2024-05-01T23:59:30.000000Z"));
            assert_eq!(row["source_system"], json!("crm"));
            assert_eq!(row["batch_id"], json!(batch_id.to_string()));
            assert_eq!(row["ingest_date"], json!("2024-05-01"));
        }
    }

    #[test]
    fn envelope_overwrites_payload_fields() {
        let envelope = Envelope::capture("crm", BatchId::generate(), now());
        let row = envelope.stamp_record(record(json!({"source_system": "spoofed", "v": 1})));
        assert_eq!(row["source_system"], json!("crm"));
        assert_eq!(row["v"], json!(1));
    }

    #[test]
    fn envelope_roundtrips_through_a_row() {
        let envelope = Envelope::capture("erp", BatchId::generate(), now());
        let row = envelope.stamp_record(Record::new());
        assert_eq!(Envelope::from_row(&row), Some(envelope.clone()));
        assert_eq!(
            envelope.partition().to_string(),
            "source_system=erp/ingest_date=2024-05-01"
        );
        assert_eq!(Envelope::from_row(&record(json!({"ingest_timestamp": "nope"}))), None);
    }

    #[test]
    fn batch_ids_are_v7_and_parse() {
        let id = BatchId::generate();
        assert_eq!(id.as_uuid().get_version_num(), 7);
        assert_eq!(id.to_string().parse::<BatchId>().expect("parse"), id);
        assert!("not-a-uuid".parse::<BatchId>().is_err());
    }
}
