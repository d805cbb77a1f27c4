//! Ingestion pipeline: decode, validate, persist, broadcast.
//!
//! Producers (the MQTT adapter and the simulator) never run the pipeline
//! themselves. They push decoded [`InboundReading`]s into a bounded queue
//! with [`enqueue`], and a single worker started by [`spawn_ingest_worker`]
//! drains the queue and runs [`IngestionPipeline::process`] for each record.
//! The broker's delivery loop therefore never waits on the database or on
//! observer sends.
//!
//! A reading is broadcast only after it has been durably written, and each
//! inbound record is written at most once.

use crate::api_ws::ObserverRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use speedo_db::DbPool;
use speedo_readings::{insert_reading, is_storable_timestamp, NewReading, Reading};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Errors produced while turning an inbound record into a stored reading.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The payload was not a JSON object of the expected shape.
    #[error("malformed telemetry payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// A required field was missing or empty.
    #[error("invalid reading: {0}")]
    Validation(&'static str),

    /// The reading could not be written.
    #[error("failed to persist reading: {0}")]
    Persistence(String),
}

/// A decoded inbound telemetry record, before validation.
///
/// Every field is optional at this stage so that a missing `device_id` or
/// `speed` is reported as a validation failure rather than a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundReading {
    pub device_id: Option<String>,
    pub speed: Option<f64>,
    pub unit: Option<String>,
    /// Unix seconds (integer or fractional) or an RFC 3339 string. Years
    /// outside 0000 to 9999 fail to decode.
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(i64),
    FractionalSeconds(f64),
    Text(String),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let Some(raw) = Option::<RawTimestamp>::deserialize(deserializer)? else {
        return Ok(None);
    };

    let parsed = match raw {
        RawTimestamp::Seconds(secs) => DateTime::from_timestamp(secs, 0),
        RawTimestamp::FractionalSeconds(secs) if secs.is_finite() => {
            DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
        }
        RawTimestamp::FractionalSeconds(_) => None,
        RawTimestamp::Text(text) => {
            let ts = DateTime::parse_from_rfc3339(&text).map_err(D::Error::custom)?;
            Some(ts.with_timezone(&Utc))
        }
    };

    match parsed {
        Some(ts) if is_storable_timestamp(&ts) => Ok(Some(ts)),
        _ => Err(D::Error::custom(
            "timestamp out of range, expected a year between 0000 and 9999",
        )),
    }
}

/// Decodes a raw broker payload.
///
/// # Errors
///
/// Returns `IngestError::Decode` if the bytes are not a JSON object with
/// correctly typed fields.
pub fn decode_payload(payload: &[u8]) -> Result<InboundReading, IngestError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Defaults resolved once at the ingestion boundary.
#[derive(Debug, Clone)]
pub struct IngestDefaults {
    /// Unit written when the producer sent none.
    pub unit: String,
}

impl Default for IngestDefaults {
    fn default() -> Self {
        Self {
            unit: speedo_readings::DEFAULT_UNIT.to_string(),
        }
    }
}

/// Checks required fields and fills in defaults.
///
/// `speed` is accepted as received; negative values are not clamped.
///
/// # Errors
///
/// Returns `IngestError::Validation` when `device_id` is missing or blank,
/// or when `speed` is missing.
pub fn validate(
    inbound: InboundReading,
    defaults: &IngestDefaults,
) -> Result<NewReading, IngestError> {
    let device_id = inbound
        .device_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(IngestError::Validation("device_id is required"))?;
    let speed = inbound
        .speed
        .ok_or(IngestError::Validation("speed is required"))?;
    let unit = inbound
        .unit
        .filter(|unit| !unit.trim().is_empty())
        .unwrap_or_else(|| defaults.unit.clone());

    Ok(NewReading {
        device_id,
        speed,
        unit,
        timestamp: inbound.timestamp,
    })
}

/// Persists readings and announces them to live observers.
///
/// Cloning is cheap; all clones share the same pool and registry.
#[derive(Clone)]
pub struct IngestionPipeline {
    pool: DbPool,
    registry: ObserverRegistry,
    defaults: Arc<IngestDefaults>,
}

impl IngestionPipeline {
    pub fn new(pool: DbPool, registry: ObserverRegistry, defaults: IngestDefaults) -> Self {
        Self {
            pool,
            registry,
            defaults: Arc::new(defaults),
        }
    }

    /// Validates an inbound record against this pipeline's defaults.
    ///
    /// # Errors
    ///
    /// See [`validate`].
    pub fn validate(&self, inbound: InboundReading) -> Result<NewReading, IngestError> {
        validate(inbound, &self.defaults)
    }

    /// Writes one reading on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Persistence` if no connection is available, the
    /// insert fails, or the blocking task is cancelled.
    pub async fn persist(&self, reading: NewReading) -> Result<Reading, IngestError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| IngestError::Persistence(format!("pool error: {}", e)))?;
            insert_reading(&conn, &reading).map_err(|e| IngestError::Persistence(e.to_string()))
        })
        .await
        .map_err(|e| IngestError::Persistence(format!("task join error: {}", e)))?
    }

    /// Broadcasts a stored reading to every registered observer.
    ///
    /// Returns the number of observers the message was handed to. Observer
    /// failures are handled by the registry and never surface here.
    pub async fn announce(&self, reading: &Reading) -> usize {
        match serde_json::to_string(reading) {
            Ok(message) => self.registry.broadcast(&message).await,
            Err(e) => {
                tracing::error!(
                    device_id = %reading.device_id,
                    "failed to serialize reading for broadcast: {}",
                    e
                );
                0
            }
        }
    }

    /// Validates, persists and announces one inbound record.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Validation` or `IngestError::Persistence`; in
    /// either case nothing is broadcast.
    pub async fn ingest(&self, inbound: InboundReading) -> Result<Reading, IngestError> {
        let reading = self.validate(inbound)?;
        let stored = self.persist(reading).await?;
        self.announce(&stored).await;
        Ok(stored)
    }

    /// Runs [`ingest`](Self::ingest) and logs the outcome instead of
    /// returning it. Used by the queue worker, where there is no caller to
    /// report to.
    pub async fn process(&self, inbound: InboundReading) {
        let device_id = inbound.device_id.clone().unwrap_or_default();
        match self.ingest(inbound).await {
            Ok(stored) => {
                tracing::debug!(
                    device_id = %stored.device_id,
                    speed = stored.speed,
                    reading_id = stored.id,
                    "ingested reading"
                );
            }
            Err(e @ IngestError::Persistence(_)) => {
                tracing::error!(device_id = %device_id, "{}", e);
            }
            Err(e) => {
                tracing::warn!(device_id = %device_id, "discarding inbound reading: {}", e);
            }
        }
    }
}

/// Hands a decoded record to the ingest queue without waiting.
///
/// Returns `false` if the record was dropped because the queue is full or
/// the worker has stopped.
pub fn enqueue(
    queue: &mpsc::Sender<InboundReading>,
    inbound: InboundReading,
    source: &'static str,
) -> bool {
    match queue.try_send(inbound) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            tracing::warn!(
                source,
                device_id = dropped.device_id.as_deref().unwrap_or(""),
                "ingest queue full, dropping reading"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::error!(source, "ingest queue closed, dropping reading");
            false
        }
    }
}

/// Starts the worker that drains the ingest queue.
///
/// Records are processed one at a time in arrival order. The worker exits
/// once every sender has been dropped and the queue is empty.
pub fn spawn_ingest_worker(
    pipeline: IngestionPipeline,
    mut queue: mpsc::Receiver<InboundReading>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("ingest worker started");
        while let Some(inbound) = queue.recv().await {
            pipeline.process(inbound).await;
        }
        tracing::info!("ingest queue closed, worker exiting");
    })
}
