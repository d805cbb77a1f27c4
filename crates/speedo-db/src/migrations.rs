//! Schema migrations for the readings database.
//!
//! The schema ships inside the binary as numbered SQL files. On startup the
//! runner reads the names recorded in `_speedo_migrations`, works out which
//! embedded files are missing from that set, and applies them in order.
//! A migration and its tracking row commit together or not at all.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

/// A single embedded migration.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_speed_readings",
        sql: include_str!("migrations/001_speed_readings.sql"),
    },
];

/// `000_init` is idempotent, so the runner executes it up front to make the
/// tracking table readable on an empty database.
const TRACKING_TABLE_SQL: &str = include_str!("migrations/000_init.sql");

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The tracking table could not be created.
    #[error("failed to prepare migration tracking table: {0}")]
    Bootstrap(rusqlite::Error),

    /// The set of applied migrations could not be read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),

    /// A migration failed and was rolled back.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },
}

/// Applies every embedded migration not yet recorded.
///
/// Returns the number of migrations applied by this call, so a second run
/// on the same database returns 0.
///
/// # Errors
///
/// Returns `MigrationError` if the tracking table cannot be prepared or
/// read, or if a migration fails. Migrations before the failing one stay
/// applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

/// Names of embedded migrations that have not been applied to `conn`.
///
/// # Errors
///
/// Returns `MigrationError` if the tracking table cannot be prepared or read.
pub fn pending_migrations(conn: &Connection) -> Result<Vec<&'static str>, MigrationError> {
    conn.execute_batch(TRACKING_TABLE_SQL)
        .map_err(MigrationError::Bootstrap)?;
    let applied = applied_names(conn)?;
    Ok(pending(MIGRATIONS, &applied).map(|m| m.name).collect())
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE_SQL)
        .map_err(MigrationError::Bootstrap)?;

    let applied = applied_names(conn)?;
    let mut count = 0;

    for migration in pending(migrations, &applied) {
        tracing::info!(migration = migration.name, "applying migration");
        apply(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
        count += 1;
    }

    tracing::debug!(
        applied = count,
        known = migrations.len(),
        "schema is up to date"
    );
    Ok(count)
}

fn applied_names(conn: &Connection) -> Result<HashSet<String>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT name FROM _speedo_migrations")
        .map_err(MigrationError::StateQuery)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(MigrationError::StateQuery)?
        .collect::<Result<HashSet<_>, _>>()
        .map_err(MigrationError::StateQuery)?;
    Ok(names)
}

fn pending<'a>(
    migrations: &'a [Migration],
    applied: &'a HashSet<String>,
) -> impl Iterator<Item = &'a Migration> + 'a {
    migrations
        .iter()
        .filter(move |m| !applied.contains(m.name))
}

/// Runs one migration and records it in the same transaction.
fn apply(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _speedo_migrations (name) VALUES (?1)",
        [migration.name],
    )?;
    tx.commit()
}
