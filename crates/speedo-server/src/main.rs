//! Speedometer backend binary.
//!
//! Starts the broker subscription, the ingest worker and the axum HTTP
//! server, with structured logging, database initialization, and graceful
//! shutdown on SIGTERM/SIGINT.

use speedo_server::{app, config, ingest, mqtt::EventSourceAdapter, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for the ingest worker to drain the queue.
const INGEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SPEEDO_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        file_loaded = config.file_loaded,
        "resolved startup configuration path"
    );
    if !config.file_loaded {
        tracing::info!("config file not found, using defaults");
    }

    let pool = speedo_db::create_pool(
        &config.database.path,
        speedo_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = speedo_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let (state, queue_rx) = AppState::new(pool, &config);
    let worker = ingest::spawn_ingest_worker(state.pipeline.clone(), queue_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let adapter = if config.mqtt.enabled {
        let adapter = EventSourceAdapter::new(config.mqtt.clone(), state.queue.clone());
        Some(tokio::spawn(adapter.run(shutdown_rx)))
    } else {
        tracing::info!("broker subscription disabled");
        None
    };

    let simulator = state.simulator.clone();
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting speedometer backend");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    // Stop producers first so the worker sees every sender go away.
    simulator.stop().await;
    drop(simulator);
    let _ = shutdown_tx.send(true);
    if let Some(handle) = adapter {
        if let Err(e) = handle.await {
            tracing::error!("broker subscription task join error: {}", e);
        }
    }

    match tokio::time::timeout(INGEST_DRAIN_TIMEOUT, worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("ingest worker join error: {}", e),
        Err(_) => tracing::warn!("ingest worker did not drain in time"),
    }

    tracing::info!("speedometer backend shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
