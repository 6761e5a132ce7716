//! Fixture helpers for building rows and timestamps.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

/// Converts a `json!({...})` object into a row.
///
/// # Panics
///
/// Panics if `value` is not a JSON object.
pub fn record(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture must be a JSON object, got {other}"),
    }
}

/// Builds a batch of rows from `json!` objects.
pub fn records(values: impl IntoIterator<Item = Value>) -> Vec<Map<String, Value>> {
    values.into_iter().map(record).collect()
}

/// A UTC timestamp on 2024-05-01 at `hour:minute`.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// The date used by [`at`].
pub fn fixture_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date")
}
