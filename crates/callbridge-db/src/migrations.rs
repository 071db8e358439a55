//! Tenant store schema migrations, compiled into the binary.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Append only; names are the history keys.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_tenants",
        sql: include_str!("migrations/001_tenants.sql"),
    },
    Migration {
        name: "002_phone_numbers",
        sql: include_str!("migrations/002_phone_numbers.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to read migration history: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the tenant store schema up to date.
///
/// Returns how many migrations this call applied; zero on an up-to-date
/// database.
///
/// # Errors
///
/// Returns `MigrationError` if the history cannot be read or a migration
/// fails. A failed migration leaves no partial schema behind.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

/// Names of the migrations already recorded, in the order they ran.
///
/// # Errors
///
/// Returns `MigrationError::StateQuery` if the history table is missing or
/// unreadable.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT name FROM _callbridge_migrations ORDER BY id")
        .map_err(MigrationError::StateQuery)?;
    let names = stmt
        .query_map([], |row| row.get(0))
        .and_then(|rows| rows.collect::<Result<Vec<String>, _>>())
        .map_err(MigrationError::StateQuery)?;
    Ok(names)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _callbridge_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(MigrationError::StateQuery)?;

    let done: HashSet<String> = applied_migrations(conn)?.into_iter().collect();
    let mut applied = 0;

    for migration in migrations.iter().filter(|m| !done.contains(m.name)) {
        tracing::info!(migration = migration.name, "applying migration");
        let failed = |source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        };

        // The schema change and its history row commit together.
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _callbridge_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;
        applied += 1;
    }

    if applied == 0 {
        tracing::debug!("tenant store schema is current");
    }
    Ok(applied)
}
