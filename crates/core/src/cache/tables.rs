//! Physical table layout for per-client response tables.
//!
//! Every client owns two tables with the same logical schema:
//! `api_cache_{client}_responses` keeps payloads as TEXT and
//! `api_cache_{client}_responses_compressed` keeps gzip payloads as BLOB.

use std::sync::LazyLock;

use regex::Regex;
use tokio_rusqlite::rusqlite::{self, Connection, OptionalExtension, Row, params, types::Value};

use super::Error;

const PREFIX: &str = "api_cache_";
const SUFFIX: &str = "_responses";
const COMPRESSED_SUFFIX: &str = "_compressed";

/// Identifier length budget shared by both table names of a client.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Longest client segment that still fits the compressed table name.
const MAX_SEGMENT_LEN: usize = MAX_TABLE_NAME_LEN - PREFIX.len() - SUFFIX.len() - COMPRESSED_SUFFIX.len();

/// Columns of a response table in insert order, excluding `id`.
pub const COLUMNS: &[&str] = &[
    "client",
    "key",
    "version",
    "endpoint",
    "base_url",
    "full_url",
    "method",
    "attributes",
    "credits",
    "cost",
    "request_params_summary",
    "request_headers",
    "request_body",
    "response_headers",
    "response_body",
    "response_status_code",
    "response_size",
    "response_time",
    "expires_at",
    "created_at",
    "updated_at",
    "processed_at",
    "processed_status",
];

static CLIENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("client pattern is a valid regex"));

/// Runs of anything that cannot appear in an unquoted SQL identifier, underscores included.
static SEPARATOR_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("separator pattern is a valid regex"));

/// Check a client id against `^[A-Za-z0-9_-]+$`.
pub fn validate_client(client: &str) -> Result<(), Error> {
    if !CLIENT_PATTERN.is_match(client) {
        return Err(Error::InvalidIdentifier(format!(
            "client '{client}' must match ^[A-Za-z0-9_-]+$"
        )));
    }
    Ok(())
}

/// Resolve the physical table for a client and compression mode.
///
/// Hyphens and any other non-identifier characters become underscores,
/// repeated underscores collapse, and the client segment is truncated so
/// the compressed name stays within [`MAX_TABLE_NAME_LEN`]. A client that
/// sanitizes to nothing is rejected rather than mapped onto a shared table.
///
/// Distinct clients can still resolve to the same name (`a-b` and `a_b`);
/// [`provision`] refuses the second one.
pub fn table_name(client: &str, compressed: bool) -> Result<String, Error> {
    let sanitized = SEPARATOR_RUN.replace_all(client, "_");
    let mut segment = sanitized.trim_matches('_').to_string();
    segment.truncate(MAX_SEGMENT_LEN);
    let segment = segment.trim_end_matches('_');

    if segment.is_empty() {
        return Err(Error::InvalidIdentifier(format!(
            "client '{client}' does not produce a usable table name"
        )));
    }

    Ok(format!("{PREFIX}{segment}{SUFFIX}{}", if compressed { COMPRESSED_SUFFIX } else { "" }))
}

/// DDL for one response table and its indexes.
pub fn create_table_sql(table: &str, compressed: bool) -> String {
    let payload = if compressed { "BLOB" } else { "TEXT" };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client TEXT NOT NULL,
            key TEXT NOT NULL UNIQUE,
            version TEXT,
            endpoint TEXT,
            base_url TEXT,
            full_url TEXT,
            method TEXT,
            attributes TEXT,
            credits INTEGER,
            cost REAL,
            request_params_summary TEXT,
            request_headers {payload},
            request_body {payload},
            response_headers {payload},
            response_body {payload} NOT NULL,
            response_status_code INTEGER,
            response_size INTEGER,
            response_time REAL,
            expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            processed_at TEXT,
            processed_status TEXT
        );
        CREATE INDEX IF NOT EXISTS {table}_client_endpoint_version_idx ON {table}(client, endpoint, version);
        CREATE INDEX IF NOT EXISTS {table}_expires_at_idx ON {table}(expires_at);"
    )
}

/// Create both tables for a client and record them in `_cache_tables`.
///
/// Fails with `InvalidIdentifier` when a table name is already registered
/// to a different client.
pub fn provision(conn: &Connection, client: &str) -> Result<(), Error> {
    for compressed in [false, true] {
        let table = table_name(client, compressed)?;
        if let Some(owner) = table_owner(conn, &table)?.filter(|owner| owner != client) {
            return Err(Error::InvalidIdentifier(format!(
                "client '{client}' resolves to table {table}, which belongs to client '{owner}'"
            )));
        }
        conn.execute_batch(&create_table_sql(&table, compressed))?;
        conn.execute(
            "INSERT OR IGNORE INTO _cache_tables (table_name, client, compressed, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![table, client, compressed as i32, super::now_timestamp()],
        )?;
    }
    Ok(())
}

/// Client a table is registered to, if any.
pub fn table_owner(conn: &Connection, table: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT client FROM _cache_tables WHERE table_name = ?1", params![table], |row| row.get(0))
        .optional()
}

/// SELECT list matching [`RawRow::from_row`].
pub fn select_columns() -> String {
    format!("id, {}", COLUMNS.join(", "))
}

/// Insert a row, replacing every column except `created_at` on key conflict.
pub fn upsert_sql(table: &str) -> String {
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = COLUMNS
        .iter()
        .filter(|c| !matches!(**c, "key" | "created_at"))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(key) DO UPDATE SET {}",
        COLUMNS.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

/// A response row as stored, with payload columns left in their physical form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: i64,
    pub client: String,
    pub key: String,
    pub version: Option<String>,
    pub endpoint: Option<String>,
    pub base_url: Option<String>,
    pub full_url: Option<String>,
    pub method: Option<String>,
    pub attributes: Option<String>,
    pub credits: Option<i64>,
    pub cost: Option<f64>,
    pub request_params_summary: Option<String>,
    pub request_headers: Value,
    pub request_body: Value,
    pub response_headers: Value,
    pub response_body: Value,
    pub response_status_code: Option<i64>,
    pub response_size: Option<i64>,
    pub response_time: Option<f64>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
    pub processed_status: Option<String>,
}

impl RawRow {
    /// Map a row selected with [`select_columns`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client: row.get(1)?,
            key: row.get(2)?,
            version: row.get(3)?,
            endpoint: row.get(4)?,
            base_url: row.get(5)?,
            full_url: row.get(6)?,
            method: row.get(7)?,
            attributes: row.get(8)?,
            credits: row.get(9)?,
            cost: row.get(10)?,
            request_params_summary: row.get(11)?,
            request_headers: row.get(12)?,
            request_body: row.get(13)?,
            response_headers: row.get(14)?,
            response_body: row.get(15)?,
            response_status_code: row.get(16)?,
            response_size: row.get(17)?,
            response_time: row.get(18)?,
            expires_at: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
            processed_at: row.get(22)?,
            processed_status: row.get(23)?,
        })
    }

    /// Upsert this row into `table`. The `id` is not copied.
    pub fn upsert(&self, conn: &Connection, table: &str) -> rusqlite::Result<usize> {
        conn.execute(
            &upsert_sql(table),
            params![
                &self.client,
                &self.key,
                &self.version,
                &self.endpoint,
                &self.base_url,
                &self.full_url,
                &self.method,
                &self.attributes,
                &self.credits,
                &self.cost,
                &self.request_params_summary,
                &self.request_headers,
                &self.request_body,
                &self.response_headers,
                &self.response_body,
                &self.response_status_code,
                &self.response_size,
                &self.response_time,
                &self.expires_at,
                &self.created_at,
                &self.updated_at,
                &self.processed_at,
                &self.processed_status,
            ],
        )
    }

    /// Columns that differ from `other`, ignoring `id`, `response_size`
    /// and the processing markers. Payloads compare by their byte content.
    pub fn differences(&self, other: &RawRow) -> Vec<&'static str> {
        let mut diffs = Vec::new();
        let mut check = |name: &'static str, equal: bool| {
            if !equal {
                diffs.push(name);
            }
        };

        check("client", self.client == other.client);
        check("key", self.key == other.key);
        check("version", self.version == other.version);
        check("endpoint", self.endpoint == other.endpoint);
        check("base_url", self.base_url == other.base_url);
        check("full_url", self.full_url == other.full_url);
        check("method", self.method == other.method);
        check("attributes", self.attributes == other.attributes);
        check("credits", self.credits == other.credits);
        check("cost", self.cost == other.cost);
        check("request_params_summary", self.request_params_summary == other.request_params_summary);
        check("request_headers", payload_bytes(&self.request_headers) == payload_bytes(&other.request_headers));
        check("request_body", payload_bytes(&self.request_body) == payload_bytes(&other.request_body));
        check("response_headers", payload_bytes(&self.response_headers) == payload_bytes(&other.response_headers));
        check("response_body", payload_bytes(&self.response_body) == payload_bytes(&other.response_body));
        check("response_status_code", self.response_status_code == other.response_status_code);
        check("response_time", self.response_time == other.response_time);
        check("expires_at", self.expires_at == other.expires_at);
        check("created_at", self.created_at == other.created_at);
        check("updated_at", self.updated_at == other.updated_at);

        diffs
    }
}

/// Byte content of a payload column. `None` for NULL.
pub fn payload_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Text(s) => Some(s.as_bytes()),
        Value::Blob(b) => Some(b.as_slice()),
        _ => None,
    }
}

/// Whether `table` already holds a row for `key`.
pub fn key_exists(conn: &Connection, table: &str, key: &str) -> rusqlite::Result<bool> {
    conn.query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE key = ?1)"), params![key], |row| {
        row.get(0)
    })
}

/// Fetch the row for `key` regardless of expiry.
pub fn find_by_key(conn: &Connection, table: &str, key: &str) -> rusqlite::Result<Option<RawRow>> {
    conn.query_row(
        &format!("SELECT {} FROM {table} WHERE key = ?1", select_columns()),
        params![key],
        RawRow::from_row,
    )
    .optional()
}

/// Fetch a page of `client`'s rows ordered by id.
pub fn page(
    conn: &Connection, table: &str, client: &str, limit: usize, offset: usize,
) -> rusqlite::Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {table} WHERE client = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        select_columns()
    ))?;
    let rows = stmt.query_map(params![client, limit as i64, offset as i64], RawRow::from_row)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_modes() {
        assert_eq!(table_name("a", false).unwrap(), "api_cache_a_responses");
        assert_eq!(table_name("a", true).unwrap(), "api_cache_a_responses_compressed");
    }

    #[test]
    fn test_table_name_sanitizes_hyphens() {
        assert_eq!(table_name("open-data", false).unwrap(), "api_cache_open_data_responses");
        assert_eq!(table_name("a--b__c", false).unwrap(), "api_cache_a_b_c_responses");
    }

    #[test]
    fn test_table_name_degenerate_client() {
        assert!(matches!(table_name("__", false), Err(Error::InvalidIdentifier(_))));
        assert!(matches!(table_name("-", true), Err(Error::InvalidIdentifier(_))));
        assert!(matches!(table_name("", false), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn test_table_name_length_budget() {
        let client = "x".repeat(100);
        let plain = table_name(&client, false).unwrap();
        let compressed = table_name(&client, true).unwrap();
        assert!(compressed.len() <= MAX_TABLE_NAME_LEN);
        assert_eq!(compressed, format!("{plain}_compressed"));
    }

    #[test]
    fn test_table_name_truncation_trims_trailing_underscore() {
        let client = format!("{}-tail", "y".repeat(MAX_SEGMENT_LEN - 1));
        let name = table_name(&client, false).unwrap();
        assert!(!name.contains("__"));
    }

    #[test]
    fn test_validate_client() {
        assert!(validate_client("acme").is_ok());
        assert!(validate_client("Acme_Corp-2").is_ok());
        assert!(validate_client("").is_err());
        assert!(validate_client("acme corp").is_err());
        assert!(validate_client("acme.corp").is_err());
        assert!(validate_client("acme;drop").is_err());
    }

    fn registry() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("../../migrations/001_cache_registry.sql")).unwrap();
        conn
    }

    #[test]
    fn test_provision_refuses_colliding_client() {
        assert_eq!(table_name("a-b", false).unwrap(), table_name("a_b", false).unwrap());

        let conn = registry();
        provision(&conn, "a_b").unwrap();
        provision(&conn, "a_b").unwrap();

        let result = provision(&conn, "a-b");
        assert!(matches!(result, Err(Error::InvalidIdentifier(msg)) if msg.contains("'a_b'")));
        assert_eq!(table_owner(&conn, "api_cache_a_b_responses").unwrap().as_deref(), Some("a_b"));
    }

    #[test]
    fn test_provision_refuses_truncated_collision() {
        let shared = "z".repeat(MAX_SEGMENT_LEN);
        let conn = registry();
        provision(&conn, &format!("{shared}one")).unwrap();
        assert!(matches!(provision(&conn, &format!("{shared}two")), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn test_page_filters_by_client() {
        let conn = registry();
        provision(&conn, "acme").unwrap();
        let table = table_name("acme", false).unwrap();
        for (client, key) in [("acme", "k1"), ("intruder", "k2"), ("acme", "k3")] {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (client, key, response_body, created_at, updated_at) VALUES (?1, ?2, 'x', 't', 't')"
                ),
                params![client, key],
            )
            .unwrap();
        }

        let rows = page(&conn, &table, "acme", 10, 0).unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k3"]);
        assert_eq!(page(&conn, &table, "acme", 1, 1).unwrap()[0].key, "k3");
    }

    #[test]
    fn test_upsert_sql_keeps_created_at() {
        let sql = upsert_sql("t");
        assert!(sql.contains("ON CONFLICT(key)"));
        assert!(!sql.contains("created_at = excluded.created_at"));
        assert!(sql.contains("updated_at = excluded.updated_at"));
    }

    #[test]
    fn test_payload_bytes_compares_text_and_blob() {
        let text = Value::Text("abc".into());
        let blob = Value::Blob(b"abc".to_vec());
        assert_eq!(payload_bytes(&text), payload_bytes(&blob));
        assert_eq!(payload_bytes(&Value::Null), None);
    }
}
