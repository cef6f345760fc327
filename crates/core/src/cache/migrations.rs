//! Schema migrations for the shared registry tables.
//!
//! Per-client response tables are created on demand by [`super::tables`];
//! only tables every database needs are versioned here. Each pending
//! migration runs in its own transaction together with its `_migrations`
//! row, so a failed step leaves no partial schema behind.

use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, params};

use super::Error;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "cache_registry", sql: include_str!("../../migrations/001_cache_registry.sql") },
    Migration {
        version: 2,
        name: "cache_table_modes",
        sql: include_str!("../../migrations/002_cache_table_modes.sql"),
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| apply(conn, MIGRATIONS)).await.map_err(Error::from)
}

fn apply(conn: &mut rusqlite::Connection, migrations: &[Migration]) -> Result<(), Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?;

    for migration in migrations.iter().filter(|m| m.version > current) {
        let failed = |e: rusqlite::Error| {
            Error::MigrationFailed(format!("{:03}_{}: {e}", migration.version, migration.name))
        };

        let tx = conn.transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, super::now_timestamp()],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(version = migration.version, name = migration.name, "applied migration");
    }

    Ok(())
}
