//! Reading store for the speedometer backend.
//!
//! Persists validated speed readings in the append-only `speed_readings`
//! table and answers the two read patterns the query surface needs: the
//! latest reading and a recency window bounded by a row limit.
//!
//! Readings are never updated or deleted here; retention is an operational
//! concern outside this crate.
//!
//! # Usage
//!
//! ```rust,ignore
//! use speedo_readings::{insert_reading, NewReading, DEFAULT_UNIT};
//!
//! let stored = insert_reading(
//!     &conn,
//!     &NewReading {
//!         device_id: "car1".to_string(),
//!         speed: 42.5,
//!         unit: DEFAULT_UNIT.to_string(),
//!         timestamp: None,
//!     },
//! )?;
//! ```

mod error;
mod reading;
mod store;

pub use error::ReadingError;
pub use reading::{
    format_timestamp, is_storable_timestamp, parse_timestamp, NewReading, Reading, DEFAULT_UNIT,
};
pub use store::{insert_reading, latest_reading, query_readings, ReadingQuery};

#[cfg(test)]
mod tests;
