//! Per-client gzip compression of cached payloads.
//!
//! `compress`/`decompress` follow the client's `compression_enabled` flag and
//! pass data through untouched when it is off. The `force_*` variants ignore
//! the flag; table conversion uses them because a compressed table always
//! holds gzip payloads whatever the client's current setting.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::Error;
use crate::config::AppConfig;

/// Compression policy for every client.
#[derive(Debug, Clone)]
pub struct CompressionService {
    enabled: Arc<HashMap<String, bool>>,
    level: Compression,
}

impl CompressionService {
    /// Create a service from per-client flags and a gzip level (0-9).
    pub fn new(enabled: HashMap<String, bool>, level: u32) -> Self {
        Self { enabled: Arc::new(enabled), level: Compression::new(level.min(9)) }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let enabled = config
            .clients
            .iter()
            .map(|(name, client)| (name.clone(), client.compression_enabled))
            .collect();
        Self::new(enabled, config.compression_level)
    }

    /// Whether `client` stores compressed payloads.
    pub fn is_enabled(&self, client: &str) -> bool {
        self.enabled.get(client).copied().unwrap_or(false)
    }

    /// Compress `data` if compression is enabled for `client`.
    pub fn compress(&self, client: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.is_enabled(client) || data.is_empty() {
            return Ok(data.to_vec());
        }
        let compressed = self.gzip(data)?;
        tracing::debug!(
            client,
            original = data.len(),
            compressed = compressed.len(),
            ratio = compressed.len() as f64 / data.len() as f64,
            "compressed payload"
        );
        Ok(compressed)
    }

    /// Decompress `data` if compression is enabled for `client`.
    pub fn decompress(&self, client: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.is_enabled(client) || data.is_empty() {
            return Ok(data.to_vec());
        }
        gunzip(data)
    }

    /// Compress regardless of client settings.
    pub fn force_compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        self.gzip(data)
    }

    /// Decompress regardless of client settings.
    pub fn force_decompress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        gunzip(data)
    }

    fn gzip(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .map_err(|e| Error::CompressionFailure(e.to_string()))?;
        encoder.finish().map_err(|e| Error::CompressionFailure(e.to_string()))
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::CompressionFailure(format!("invalid gzip payload: {e}")))?;
    Ok(out)
}
