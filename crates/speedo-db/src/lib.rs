//! Database layer for the speedometer backend.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. The `speed_readings` table and its index are
//! created here; query helpers live in `speedo-readings`.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: readers (history and latest queries) never
//!   block the single ingest writer.
//! - **`r2d2` connection pool**: bounded connection reuse shared between the
//!   ingest worker and HTTP handlers.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and applied once each on startup.

mod migrations;
mod pool;

pub use migrations::{pending_migrations, run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
