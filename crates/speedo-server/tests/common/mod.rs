#![allow(dead_code)]

use speedo_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use speedo_server::config::Config;
use speedo_server::ingest::InboundReading;
use speedo_server::AppState;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// A file-backed database that lives as long as the returned guard.
pub struct TestDb {
    pub pool: DbPool,
    _dir: TempDir,
}

/// Opens a fresh database, optionally running migrations.
pub fn test_db(migrate: bool) -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("speedo.db");
    let pool = create_pool(
        path.to_str().expect("temp path is utf-8"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");

    if migrate {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }

    TestDb { pool, _dir: dir }
}

/// Builds application state over a migrated database with default config.
pub fn test_state() -> (AppState, mpsc::Receiver<InboundReading>, TestDb) {
    test_state_with(Config::default())
}

pub fn test_state_with(config: Config) -> (AppState, mpsc::Receiver<InboundReading>, TestDb) {
    let db = test_db(true);
    let (state, rx) = AppState::new(db.pool.clone(), &config);
    (state, rx, db)
}

pub fn inbound(device_id: &str, speed: f64) -> InboundReading {
    InboundReading {
        device_id: Some(device_id.to_string()),
        speed: Some(speed),
        ..Default::default()
    }
}
