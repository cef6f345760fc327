//! Response storage and retrieval.
//!
//! The repository routes each client to its plain or compressed table,
//! applies the compression policy on the way in and out, and owns the
//! expiry predicates used by reads, counts and the sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{OptionalExtension, types::Value};

use super::compression::CompressionService;
use super::connection::CacheDb;
use super::entry::{CacheEntry, StoreMetadata};
use super::tables::{self, RawRow, payload_bytes, select_columns};
use super::{Error, now_timestamp, timestamp};
use crate::config::AppConfig;

const NOT_EXPIRED: &str = "expires_at IS NULL OR expires_at > ?1";
const EXPIRED: &str = "expires_at IS NOT NULL AND expires_at <= ?1";
/// `NOT_EXPIRED` with the timestamp bound to the second parameter.
const NOT_EXPIRED_PARAM2: &str = "expires_at IS NULL OR expires_at > ?2";

/// Row counts for one client's active table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: u64,
    pub active: u64,
    pub expired: u64,
}

/// A provisioned physical table as recorded in `_cache_tables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub client: String,
    pub compressed: bool,
    pub created_at: String,
}

/// Cache repository over a [`CacheDb`].
#[derive(Clone, Debug)]
pub struct CacheRepository {
    pub(crate) db: CacheDb,
    pub(crate) compression: CompressionService,
    clients: Arc<Vec<String>>,
    provisioned: Arc<DashSet<String>>,
}

impl CacheRepository {
    /// Create a repository. `clients` is the set swept by `delete_expired(None)`.
    pub fn new(db: CacheDb, compression: CompressionService, clients: Vec<String>) -> Self {
        Self { db, compression, clients: Arc::new(clients), provisioned: Arc::new(DashSet::new()) }
    }

    pub fn from_config(db: CacheDb, config: &AppConfig) -> Self {
        Self::new(db, CompressionService::from_config(config), config.client_names())
    }

    pub fn compression(&self) -> &CompressionService {
        &self.compression
    }

    /// Table that currently serves `client`, chosen by its compression flag.
    pub fn table_name(&self, client: &str) -> Result<String, Error> {
        tables::table_name(client, self.compression.is_enabled(client))
    }

    /// Create both physical tables for `client` if they are missing.
    pub async fn ensure_tables(&self, client: &str) -> Result<(), Error> {
        tables::validate_client(client)?;
        if self.provisioned.contains(client) {
            return Ok(());
        }

        let name = client.to_string();
        self.db
            .conn
            .call(move |conn| -> Result<(), Error> { tables::provision(conn, &name) })
            .await
            .map_err(Error::from)?;

        self.provisioned.insert(client.to_string());
        Ok(())
    }

    /// Provision tables for every configured client.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        for client in self.clients.iter() {
            self.ensure_tables(client).await?;
        }
        Ok(())
    }

    /// List provisioned tables from the registry.
    pub async fn list_tables(&self) -> Result<Vec<TableInfo>, Error> {
        self.db
            .conn
            .call(|conn| -> Result<Vec<TableInfo>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT table_name, client, compressed, created_at FROM _cache_tables ORDER BY table_name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(TableInfo {
                        table_name: row.get(0)?,
                        client: row.get(1)?,
                        compressed: row.get::<_, i32>(2)? == 1,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Store a response for `key`.
    ///
    /// `ttl` is in seconds; `None` stores an entry that never expires.
    /// Storing an existing key replaces it.
    ///
    /// # Errors
    ///
    /// - `MissingRequiredField` if `response_body` is absent or empty
    /// - `InvalidInput` if `ttl` puts the expiry outside the representable range
    /// - `EncodingFailure` if headers cannot be JSON-encoded
    /// - `CompressionFailure` if gzip fails
    pub async fn store(&self, client: &str, key: &str, metadata: StoreMetadata, ttl: Option<i64>) -> Result<(), Error> {
        let table = self.table_name(client)?;
        let body = metadata
            .response_body
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::MissingRequiredField("response_body".into()))?;

        self.ensure_tables(client).await?;

        let now = Utc::now();
        let created_at = timestamp(now);
        let expires_at = ttl.map(|secs| expiry(now, secs)).transpose()?;

        let response_body = self.pack(client, Some(body))?;
        let response_size = payload_bytes(&response_body).map(|b| b.len() as i64);

        let row = RawRow {
            id: 0,
            client: client.to_string(),
            key: key.to_string(),
            version: metadata.version,
            endpoint: metadata.endpoint,
            base_url: metadata.base_url,
            full_url: metadata.full_url,
            method: Some(metadata.method.unwrap_or_else(|| "GET".to_string())),
            attributes: metadata.attributes,
            credits: metadata.credits,
            cost: metadata.cost,
            request_params_summary: metadata.request_params_summary,
            request_headers: self.pack(client, encode_headers(metadata.request_headers.as_ref())?)?,
            request_body: self.pack(client, metadata.request_body)?,
            response_headers: self.pack(client, encode_headers(metadata.response_headers.as_ref())?)?,
            response_body,
            response_status_code: metadata.response_status_code,
            response_size,
            response_time: metadata.response_time,
            expires_at,
            created_at: created_at.clone(),
            updated_at: created_at,
            processed_at: None,
            processed_status: None,
        };

        let log_table = table.clone();
        self.db
            .conn
            .call(move |conn| -> Result<(), Error> {
                row.upsert(conn, &table)?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        tracing::info!(client, key, table = %log_table, size = ?response_size, ttl = ?ttl, "stored response");
        Ok(())
    }

    /// Fetch the live entry for `key`.
    ///
    /// Expired rows are invisible here but stay in the table until swept.
    pub async fn get(&self, client: &str, key: &str) -> Result<Option<CacheEntry>, Error> {
        let table = self.table_name(client)?;
        self.ensure_tables(client).await?;

        let key = key.to_string();
        let owner = client.to_string();
        let now = now_timestamp();
        let row = self
            .db
            .conn
            .call(move |conn| -> Result<Option<RawRow>, Error> {
                let sql = format!(
                    "SELECT {} FROM {table} WHERE key = ?1 AND client = ?3 AND ({NOT_EXPIRED_PARAM2})",
                    select_columns()
                );
                Ok(conn.query_row(&sql, params![key, now, owner], RawRow::from_row).optional()?)
            })
            .await
            .map_err(Error::from)?;

        row.map(|row| self.decode(client, row)).transpose()
    }

    /// Every row in the client's table, expired or not.
    pub async fn count_total_responses(&self, client: &str) -> Result<u64, Error> {
        self.count(client, None).await
    }

    /// Rows that `get` would return.
    pub async fn count_active_responses(&self, client: &str) -> Result<u64, Error> {
        self.count(client, Some(NOT_EXPIRED)).await
    }

    /// Rows whose `expires_at` has passed.
    pub async fn count_expired_responses(&self, client: &str) -> Result<u64, Error> {
        self.count(client, Some(EXPIRED)).await
    }

    pub async fn stats(&self, client: &str) -> Result<CacheStats, Error> {
        Ok(CacheStats {
            total: self.count_total_responses(client).await?,
            active: self.count_active_responses(client).await?,
            expired: self.count_expired_responses(client).await?,
        })
    }

    async fn count(&self, client: &str, filter: Option<&'static str>) -> Result<u64, Error> {
        let table = self.table_name(client)?;
        self.ensure_tables(client).await?;

        let owner = client.to_string();
        let now = now_timestamp();
        self.db
            .conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = match filter {
                    Some(filter) => conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table} WHERE client = ?2 AND ({filter})"),
                        params![now, owner],
                        |row| row.get(0),
                    )?,
                    None => conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table} WHERE client = ?1"),
                        params![owner],
                        |row| row.get(0),
                    )?,
                };
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired rows for `client`, or for every configured client.
    ///
    /// Both physical tables of each client are swept. Returns the number of
    /// deleted rows.
    pub async fn delete_expired(&self, client: Option<&str>) -> Result<u64, Error> {
        let clients: Vec<String> = match client {
            Some(client) => vec![client.to_string()],
            None => self.clients.to_vec(),
        };

        let mut deleted = 0u64;
        for client in &clients {
            self.ensure_tables(client).await?;
            let names = [tables::table_name(client, false)?, tables::table_name(client, true)?];
            let owner = client.clone();
            let now = now_timestamp();
            let count = self
                .db
                .conn
                .call(move |conn| -> Result<u64, Error> {
                    let mut count = 0;
                    for table in &names {
                        count += conn.execute(
                            &format!("DELETE FROM {table} WHERE client = ?2 AND ({EXPIRED})"),
                            params![now, owner],
                        )?;
                    }
                    Ok(count as u64)
                })
                .await
                .map_err(Error::from)?;

            tracing::info!(client = %client, deleted = count, "swept expired responses");
            deleted += count;
        }

        Ok(deleted)
    }

    fn pack(&self, client: &str, text: Option<String>) -> Result<Value, Error> {
        let Some(text) = text else {
            return Ok(Value::Null);
        };
        if self.compression.is_enabled(client) {
            Ok(Value::Blob(self.compression.compress(client, text.as_bytes())?))
        } else {
            Ok(Value::Text(text))
        }
    }

    fn unpack(&self, client: &str, value: &Value, field: &str) -> Result<Option<String>, Error> {
        let Some(bytes) = payload_bytes(value) else {
            return Ok(None);
        };
        let raw = self.compression.decompress(client, bytes)?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| Error::DecodingFailure(format!("{field} is not valid UTF-8: {e}")))
    }

    fn unpack_headers(&self, client: &str, value: &Value, field: &str) -> Result<Option<Json>, Error> {
        let Some(text) = self.unpack(client, value, field)? else {
            return Ok(None);
        };
        serde_json::from_str(&text).map(Some).map_err(|e| {
            let sample: String = text.chars().take(100).collect();
            tracing::warn!(client, field, sample = %sample, error = %e, "failed to decode stored headers");
            Error::DecodingFailure(format!("{field}: {e}"))
        })
    }

    fn decode(&self, client: &str, row: RawRow) -> Result<CacheEntry, Error> {
        let request_headers = self.unpack_headers(client, &row.request_headers, "request_headers")?;
        let request_body = self.unpack(client, &row.request_body, "request_body")?;
        let response_headers = self.unpack_headers(client, &row.response_headers, "response_headers")?;
        let response_body = self
            .unpack(client, &row.response_body, "response_body")?
            .unwrap_or_default();

        Ok(CacheEntry {
            id: row.id,
            client: row.client,
            key: row.key,
            version: row.version,
            endpoint: row.endpoint,
            base_url: row.base_url,
            full_url: row.full_url,
            method: row.method,
            attributes: row.attributes,
            credits: row.credits,
            cost: row.cost,
            request_params_summary: row.request_params_summary,
            request_headers,
            request_body,
            response_headers,
            response_body,
            response_status_code: row.response_status_code,
            response_size: row.response_size,
            response_time: row.response_time,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            processed_status: row.processed_status,
        })
    }
}

/// Expiry timestamp `ttl` seconds after `now`.
fn expiry(now: DateTime<Utc>, ttl: i64) -> Result<String, Error> {
    Duration::try_seconds(ttl)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map(timestamp)
        .ok_or_else(|| Error::InvalidInput(format!("ttl of {ttl} seconds is out of range")))
}

fn encode_headers(headers: Option<&Json>) -> Result<Option<String>, Error> {
    match headers {
        None | Some(Json::Null) => Ok(None),
        Some(headers) => serde_json::to_string(headers)
            .map(Some)
            .map_err(|e| Error::EncodingFailure(format!("headers: {e}"))),
    }
}
