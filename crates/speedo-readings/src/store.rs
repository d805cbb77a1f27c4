//! Persistence operations for speed readings.
//!
//! All writes go through [`insert_reading`], a single `INSERT ... RETURNING`
//! statement, so a reading is either fully stored or not at all. Reads go
//! through [`latest_reading`] and [`query_readings`], both newest first.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::ReadingError;
use crate::reading::{
    format_timestamp, is_storable_timestamp, parse_timestamp, NewReading, Reading,
};

/// Writes one reading and returns the stored row.
///
/// When `reading.timestamp` is `None` the statement assigns the current UTC
/// time, so the timestamp reflects the moment of the write.
///
/// # Errors
///
/// Returns `ReadingError::InvalidTimestamp` without writing anything if the
/// supplied timestamp falls outside years 0000 to 9999, and
/// `ReadingError::Database` if the insert fails (locked database, read-only
/// file, constraint violation).
pub fn insert_reading(conn: &Connection, reading: &NewReading) -> Result<Reading, ReadingError> {
    if let Some(ts) = reading.timestamp.as_ref() {
        if !is_storable_timestamp(ts) {
            return Err(ReadingError::InvalidTimestamp(format!(
                "{} is outside years 0000-9999",
                format_timestamp(ts)
            )));
        }
    }
    let supplied_ts = reading.timestamp.as_ref().map(format_timestamp);

    let (id, stored_ts) = conn.query_row(
        "INSERT INTO speed_readings (device_id, speed, unit, timestamp)
         VALUES (?1, ?2, ?3, COALESCE(?4, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')))
         RETURNING id, timestamp",
        params![reading.device_id, reading.speed, reading.unit, supplied_ts],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )?;

    Ok(Reading {
        id,
        device_id: reading.device_id.clone(),
        speed: reading.speed,
        unit: reading.unit.clone(),
        timestamp: parse_timestamp(&stored_ts)?,
    })
}

/// Returns the most recent reading, or `None` when the store is empty.
///
/// Ties on timestamp are broken by insertion order.
///
/// # Errors
///
/// Returns `ReadingError::Database` on SQL failure.
pub fn latest_reading(conn: &Connection) -> Result<Option<Reading>, ReadingError> {
    let raw = conn
        .query_row(
            "SELECT id, device_id, speed, unit, timestamp
             FROM speed_readings
             ORDER BY timestamp DESC, id DESC
             LIMIT 1",
            [],
            raw_reading,
        )
        .optional()?;

    raw.map(RawReading::into_reading).transpose()
}

/// Time-window query over stored readings.
#[derive(Debug, Clone)]
pub struct ReadingQuery {
    /// Only readings strictly newer than this instant are returned.
    pub since: DateTime<Utc>,
    /// Maximum number of readings to return.
    pub limit: i64,
}

/// Returns readings newer than `query.since`, newest first, at most
/// `query.limit` of them.
///
/// # Errors
///
/// Returns `ReadingError::Database` on SQL failure.
pub fn query_readings(
    conn: &Connection,
    query: &ReadingQuery,
) -> Result<Vec<Reading>, ReadingError> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, speed, unit, timestamp
         FROM speed_readings
         WHERE timestamp > ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(
        params![format_timestamp(&query.since), query.limit],
        raw_reading,
    )?;

    let mut readings = Vec::new();
    for row in rows {
        readings.push(row?.into_reading()?);
    }

    Ok(readings)
}

/// Row as read from SQLite, before the timestamp is parsed.
struct RawReading {
    id: i64,
    device_id: String,
    speed: f64,
    unit: String,
    timestamp: String,
}

impl RawReading {
    fn into_reading(self) -> Result<Reading, ReadingError> {
        Ok(Reading {
            id: self.id,
            device_id: self.device_id,
            speed: self.speed,
            unit: self.unit,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

fn raw_reading(row: &Row<'_>) -> rusqlite::Result<RawReading> {
    Ok(RawReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        speed: row.get(2)?,
        unit: row.get(3)?,
        timestamp: row.get(4)?,
    })
}
