//! Database handle for the response cache.
//!
//! Opening a database applies the connection pragmas and brings the
//! registry schema up to date. File databases run in WAL mode so the CLI
//! can sweep or convert while an application process keeps serving.

use std::path::Path;

use tokio_rusqlite::Connection;

use super::migrations;
use crate::Error;

/// Pragmas applied to every connection.
const PRAGMAS: &str = "PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;
     PRAGMA busy_timeout=5000;";

/// Cache database handle.
///
/// Cloning is cheap; clones share one background connection thread.
#[derive(Clone, Debug)]
pub struct CacheDb {
    pub(crate) conn: Connection,
}

impl CacheDb {
    /// Open (or create) the database file at `path`.
    ///
    /// Missing parent directories are created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::InvalidInput(format!("cannot create database directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, true).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, false).await
    }

    async fn init(conn: Connection, wal: bool) -> Result<Self, Error> {
        let journal_mode = conn
            .call(move |conn| {
                conn.execute_batch(PRAGMAS)?;
                let mode = if wal { "WAL" } else { "MEMORY" };
                conn.query_row(&format!("PRAGMA journal_mode={mode}"), [], |row| row.get::<_, String>(0))
            })
            .await
            .map_err(Error::Database)?;

        tracing::debug!(journal_mode = %journal_mode, "cache database opened");
        migrations::run(&conn).await?;

        Ok(Self { conn })
    }
}
