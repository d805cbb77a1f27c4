//! SQLite connection pool shared by the ingest worker and HTTP handlers.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;
use thiserror::Error;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on a competing writer before failing,
    /// in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Applies per-connection pragmas.
///
/// WAL lets `/current` and `/history` read while the ingest worker writes.
/// `synchronous = NORMAL` is durable across application crashes in WAL mode.
fn init_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {}, expected wal", journal_mode)),
        ));
    }

    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")
}

/// Opens a pool of connections to the database file at `db_path`.
///
/// `:memory:` gives each pooled connection its own private database, so
/// callers that share state across connections need a real file.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the first connection cannot be opened
/// or initialized.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let busy_timeout = Duration::from_millis(settings.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| init_connection(conn, busy_timeout));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size.max(1))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        "opened sqlite pool"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_connections_get_pragmas() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("pool.db");
        let pool = create_pool(
            path.to_str().expect("utf-8 path"),
            DbRuntimeSettings {
                busy_timeout_ms: 1_234,
                pool_max_size: 2,
            },
        )
        .expect("pool should open");

        let conn = pool.get().expect("connection");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(timeout, 1_234);

        // NORMAL = 1
        let sync: i64 = conn
            .query_row("PRAGMA synchronous;", [], |row| row.get(0))
            .expect("synchronous");
        assert_eq!(sync, 1);
        assert_eq!(pool.max_size(), 2);
    }

    #[test]
    fn zero_pool_size_is_raised_to_one() {
        let pool = create_pool(
            ":memory:",
            DbRuntimeSettings {
                busy_timeout_ms: 0,
                pool_max_size: 0,
            },
        )
        .expect("pool should open");
        assert_eq!(pool.max_size(), 1);
    }
}
