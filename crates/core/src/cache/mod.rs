//! SQLite-backed cache for outbound API responses.
//!
//! This module provides a persistent response cache using SQLite
//! with async access via tokio-rusqlite. It supports:
//!
//! - Deterministic cache keys from normalized request parameters
//! - Two physical tables per client (plain and gzip-compressed payloads)
//! - Time-based expiry with an explicit sweep
//! - Automatic schema migrations and WAL mode

pub mod compression;
pub mod connection;
pub mod entry;
pub mod hash;
pub mod migrations;
pub mod params;
pub mod repository;
pub mod tables;

use chrono::{DateTime, SecondsFormat, Utc};

pub use crate::Error;

pub use compression::CompressionService;
pub use connection::CacheDb;
pub use entry::{ApiResult, CacheEntry, RequestMeta, ResponseMeta, StoreMetadata};
pub use hash::generate_cache_key;
pub use params::normalize_params;
pub use repository::{CacheRepository, CacheStats};

/// Format a timestamp for storage.
///
/// Fixed microsecond precision keeps lexical order equal to time order,
/// which the expiry predicates rely on.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time formatted for storage.
pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}
