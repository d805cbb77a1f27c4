//! Speedometer backend library logic.
//!
//! Telemetry arrives from the MQTT broker ([`mqtt`]), the simulator
//! ([`simulator`]) or direct HTTP submission ([`api`]). Every reading goes
//! through the [`ingest`] pipeline, which persists it and then broadcasts it
//! to the WebSocket observers tracked in [`api_ws`].

pub mod api;
pub mod api_ws;
pub mod config;
pub mod ingest;
pub mod mqtt;
pub mod simulator;

use api_ws::ObserverRegistry;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::{Config, QueryConfig};
use ingest::{InboundReading, IngestDefaults, IngestionPipeline};
use serde_json::{json, Value};
use simulator::SimulatorController;
use speedo_db::DbPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Live WebSocket observers.
    pub registry: ObserverRegistry,
    /// Persist-then-broadcast pipeline, shared with the ingest worker.
    pub pipeline: IngestionPipeline,
    /// Producer side of the ingest queue.
    pub queue: mpsc::Sender<InboundReading>,
    /// Simulated producer control.
    pub simulator: SimulatorController,
    /// History query defaults.
    pub query: QueryConfig,
    /// Outbound buffer size for each observer session.
    pub observer_buffer: usize,
}

impl AppState {
    /// Wires the registry, pipeline, ingest queue and simulator together.
    ///
    /// Returns the state and the consumer side of the ingest queue, which
    /// the caller hands to [`ingest::spawn_ingest_worker`].
    pub fn new(pool: DbPool, config: &Config) -> (Self, mpsc::Receiver<InboundReading>) {
        let registry = ObserverRegistry::new();
        let pipeline = IngestionPipeline::new(
            pool.clone(),
            registry.clone(),
            IngestDefaults {
                unit: config.ingest.default_unit.clone(),
            },
        );
        let (queue, queue_rx) = mpsc::channel(config.ingest.queue_capacity.max(1));
        let simulator = SimulatorController::new(queue.clone());

        let state = Self {
            pool,
            registry,
            pipeline,
            queue,
            simulator,
            query: config.query.clone(),
            observer_buffer: config.ingest.observer_buffer.max(1),
        };
        (state, queue_rx)
    }
}

/// Maximum request body size (64 KiB). Readings and simulator configs are tiny.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/speed", post(api::submit_reading_handler))
        .route("/current", get(api::get_current_handler))
        .route("/history", get(api::get_history_handler))
        .route("/simulator/start", post(api::start_simulator_handler))
        .route("/simulator/stop", post(api::stop_simulator_handler))
        .route("/simulator/status", get(api::simulator_status_handler))
        .route("/ws", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
