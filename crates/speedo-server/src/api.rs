//! Request/response handlers for readings and the simulator.
//!
//! Provides:
//! - `POST /speed`: direct submission, persisted and broadcast like a broker reading
//! - `GET /current`: latest stored reading
//! - `GET /history`: readings in a recent time window
//! - `POST /simulator/start`, `POST /simulator/stop`, `GET /simulator/status`

use crate::ingest::{IngestError, InboundReading};
use crate::simulator::{SimulatorConfig, SimulatorError, SimulatorStatus};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use speedo_readings::{latest_reading, query_readings, Reading, ReadingQuery};
use std::sync::Arc;

/// Longest window `/history` will scan, in hours.
const MAX_HISTORY_HOURS: i64 = 24 * 365;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn ingest_error_response(e: IngestError) -> Response {
    match e {
        IngestError::Decode(_) | IngestError::Validation(_) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        IngestError::Persistence(_) => {
            tracing::error!("direct submission failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Handler for `POST /speed`.
///
/// Accepts `{device_id, speed, unit?, timestamp?}` and runs it through the
/// same validate → persist → broadcast path as broker messages.
pub async fn submit_reading_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<InboundReading>, JsonRejection>,
) -> Result<Json<Reading>, Response> {
    let Json(inbound) =
        payload.map_err(|e| error_response(StatusCode::BAD_REQUEST, e.body_text()))?;

    state
        .pipeline
        .ingest(inbound)
        .await
        .map(Json)
        .map_err(ingest_error_response)
}

/// Handler for `GET /current`.
pub async fn get_current_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Reading>, Response> {
    let pool = state.pool.clone();

    let latest = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        latest_reading(&conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("task join error: {}", e),
        )
    })?
    .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    latest
        .map(Json)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "no readings recorded"))
}

/// Query parameters for `GET /history`.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Window length in hours (default from `query.history_hours`).
    pub hours: Option<i64>,
    /// Maximum number of readings (default from `query.history_limit`).
    pub limit: Option<i64>,
}

/// Handler for `GET /history`.
///
/// Returns readings newer than `now - hours`, newest first.
pub async fn get_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<Reading>>, Response> {
    let hours = params
        .hours
        .unwrap_or(state.query.history_hours)
        .clamp(1, MAX_HISTORY_HOURS);
    let limit = params
        .limit
        .unwrap_or(state.query.history_limit)
        .clamp(1, state.query.max_history_limit.max(1));

    let query = ReadingQuery {
        since: Utc::now() - Duration::hours(hours),
        limit,
    };
    let pool = state.pool.clone();

    let readings = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        query_readings(&conn, &query).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("task join error: {}", e),
        )
    })?
    .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(readings))
}

/// Handler for `POST /simulator/start`.
pub async fn start_simulator_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<SimulatorConfig>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    let Json(config) =
        payload.map_err(|e| error_response(StatusCode::BAD_REQUEST, e.body_text()))?;

    match state.simulator.start(config).await {
        Ok(config) => Ok(Json(json!({ "status": "started", "config": config }))),
        Err(e @ SimulatorError::AlreadyRunning) => {
            Err(error_response(StatusCode::CONFLICT, e.to_string()))
        }
        Err(e @ SimulatorError::InvalidConfig(_)) => {
            Err(error_response(StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

/// Handler for `POST /simulator/stop`. Stopping an idle simulator succeeds.
pub async fn stop_simulator_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let was_running = state.simulator.stop().await;
    Json(json!({ "status": "stopped", "was_running": was_running }))
}

/// Handler for `GET /simulator/status`.
pub async fn simulator_status_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<SimulatorStatus> {
    Json(state.simulator.status().await)
}
