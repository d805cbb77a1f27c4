//! Reading record types and the on-disk timestamp format.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReadingError;

/// Unit assumed when a producer does not say otherwise.
pub const DEFAULT_UNIT: &str = "km/h";

/// A persisted telemetry sample.
///
/// Serializes to the outbound broadcast shape
/// `{device_id, speed, unit, timestamp}`; the row id stays internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Row id assigned by the store.
    #[serde(skip)]
    pub id: i64,
    /// Identifier of the producing device.
    pub device_id: String,
    /// Speed magnitude exactly as received.
    pub speed: f64,
    /// Unit of `speed`.
    pub unit: String,
    /// Time of the sample, producer-supplied or assigned at write time.
    pub timestamp: DateTime<Utc>,
}

/// A validated reading that has not been written yet.
///
/// `unit` is already resolved, so a row can never be written without one.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub speed: f64,
    pub unit: String,
    /// `None` lets the store assign the write time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Formats an instant the way the `speed_readings.timestamp` column stores it.
///
/// Millisecond precision with a `Z` suffix matches SQLite's
/// `strftime('%Y-%m-%dT%H:%M:%fZ')`, keeping lexical and chronological order
/// identical.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether `ts` survives the stored text format.
///
/// Only four-digit years (0000 to 9999) format without a sign, parse back
/// as RFC 3339, and keep lexical order equal to chronological order.
pub fn is_storable_timestamp(ts: &DateTime<Utc>) -> bool {
    (0..=9999).contains(&ts.year())
}

/// Parses a stored timestamp column value.
///
/// # Errors
///
/// Returns `ReadingError::InvalidTimestamp` if the text is not RFC 3339.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ReadingError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ReadingError::InvalidTimestamp(format!("{raw}: {e}")))
}
