//! Core types and shared functionality for apicache.
//!
//! This crate provides:
//! - Deterministic cache keys for outbound API requests
//! - A SQLite-backed response cache with optional per-client compression
//! - A fixed-window attempt limiter per client
//! - The request lifecycle that ties them together
//! - Batch conversion between compressed and uncompressed cache tables

pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod manager;
pub mod ratelimit;

pub use cache::{ApiResult, CacheDb, CacheEntry, CacheRepository, CompressionService};
pub use config::{AppConfig, ClientConfig};
pub use convert::{Direction, TableConverter};
pub use error::Error;
pub use manager::{ApiCacheManager, ApiRequest, Served};
pub use ratelimit::{AttemptStore, MemoryAttemptStore, RateLimiter};
