//! Batch conversion between a client's plain and compressed tables.
//!
//! A [`TableConverter`] copies rows from one physical table to its sibling,
//! gzip-compressing (or decompressing) the four payload columns with the
//! force variants of [`CompressionService`], so the compressed table always
//! holds gzip payloads whatever the client's current setting. Each batch is
//! one transaction: an interrupted run keeps every committed batch and can
//! be resumed from the last offset. Rows already present in the target are
//! skipped unless `overwrite` is set, which makes re-runs idempotent.

mod validate;

use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite::types::Value;

pub use validate::ValidationStats;

use crate::Error;
use crate::cache::compression::CompressionService;
use crate::cache::repository::CacheRepository;
use crate::cache::tables::{self, RawRow, payload_bytes};

/// Which way rows move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Plain table to compressed table.
    Compress,
    /// Compressed table to plain table.
    Decompress,
}

impl Direction {
    fn source_is_compressed(self) -> bool {
        matches!(self, Direction::Decompress)
    }
}

/// Conversion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Rows per transaction.
    pub batch_size: usize,
    /// Replace rows whose key already exists in the target.
    pub overwrite: bool,
    /// Clear `processed_at`/`processed_status` on converted rows.
    pub reset_processed: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { batch_size: 100, overwrite: false, reset_processed: false }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub fetched_count: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}

/// Totals over a whole table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub batches: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}

impl ConversionStats {
    fn add(&mut self, batch: &BatchStats) {
        self.batches += 1;
        self.processed_count += batch.processed_count;
        self.skipped_count += batch.skipped_count;
        self.error_count += batch.error_count;
    }
}

/// Converter for one client in one direction.
#[derive(Debug, Clone)]
pub struct TableConverter {
    repository: CacheRepository,
    client: String,
    direction: Direction,
    options: ConvertOptions,
    source: String,
    target: String,
}

impl TableConverter {
    /// # Errors
    ///
    /// `InvalidIdentifier` if the client cannot name a table, `InvalidInput`
    /// for a zero batch size.
    pub fn new(
        repository: CacheRepository, client: &str, direction: Direction, options: ConvertOptions,
    ) -> Result<Self, Error> {
        tables::validate_client(client)?;
        if options.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be greater than 0".into()));
        }
        let compressed_source = direction.source_is_compressed();
        Ok(Self {
            source: tables::table_name(client, compressed_source)?,
            target: tables::table_name(client, !compressed_source)?,
            repository,
            client: client.to_string(),
            direction,
            options,
        })
    }

    pub fn source_table(&self) -> &str {
        &self.source
    }

    pub fn target_table(&self) -> &str {
        &self.target
    }

    /// Convert the batch starting at `offset` rows into the source table.
    pub async fn convert_batch(&self, offset: usize) -> Result<BatchStats, Error> {
        self.repository.ensure_tables(&self.client).await?;

        let source = self.source.clone();
        let target = self.target.clone();
        let client = self.client.clone();
        let options = self.options;
        let direction = self.direction;
        let compression = self.repository.compression.clone();

        let stats = self
            .repository
            .db
            .conn
            .call(move |conn| -> Result<BatchStats, Error> {
                let tx = conn.transaction()?;
                let rows = tables::page(&tx, &source, &client, options.batch_size, offset)?;
                let mut stats = BatchStats { fetched_count: rows.len(), ..Default::default() };

                for row in rows {
                    if !options.overwrite && tables::key_exists(&tx, &target, &row.key)? {
                        stats.skipped_count += 1;
                        continue;
                    }
                    let key = row.key.clone();
                    match convert_row(row, direction, &compression, options.reset_processed) {
                        Ok(converted) => {
                            converted.upsert(&tx, &target)?;
                            stats.processed_count += 1;
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "failed to convert row");
                            stats.error_count += 1;
                        }
                    }
                }

                tx.commit()?;
                Ok(stats)
            })
            .await
            .map_err(Error::from)?;

        tracing::info!(
            client = %self.client,
            source = %self.source,
            target = %self.target,
            offset,
            fetched = stats.fetched_count,
            processed = stats.processed_count,
            skipped = stats.skipped_count,
            errors = stats.error_count,
            "converted batch"
        );
        Ok(stats)
    }

    /// Convert every row of the source table, batch by batch.
    pub async fn convert_all(&self) -> Result<ConversionStats, Error> {
        let mut totals = ConversionStats::default();
        let mut offset = 0;
        loop {
            let batch = self.convert_batch(offset).await?;
            if batch.fetched_count == 0 {
                break;
            }
            totals.add(&batch);
            offset += batch.fetched_count;
            if batch.fetched_count < self.options.batch_size {
                break;
            }
        }
        Ok(totals)
    }
}

/// Re-encode a row's payloads for the target table.
fn convert_row(
    mut row: RawRow, direction: Direction, compression: &CompressionService, reset_processed: bool,
) -> Result<RawRow, Error> {
    row.request_headers = convert_payload(&row.request_headers, direction, compression)?;
    row.request_body = convert_payload(&row.request_body, direction, compression)?;
    row.response_headers = convert_payload(&row.response_headers, direction, compression)?;
    row.response_body = convert_payload(&row.response_body, direction, compression)?;
    row.response_size = payload_bytes(&row.response_body).map(|b| b.len() as i64);
    if reset_processed {
        row.processed_at = None;
        row.processed_status = None;
    }
    Ok(row)
}

fn convert_payload(value: &Value, direction: Direction, compression: &CompressionService) -> Result<Value, Error> {
    let Some(bytes) = payload_bytes(value) else {
        return Ok(Value::Null);
    };
    match direction {
        Direction::Compress => Ok(Value::Blob(compression.force_compress(bytes)?)),
        Direction::Decompress => decompressed_text(bytes, compression),
    }
}

/// Decompress a stored payload into a TEXT value.
pub(crate) fn decompressed_text(bytes: &[u8], compression: &CompressionService) -> Result<Value, Error> {
    let raw = compression.force_decompress(bytes)?;
    String::from_utf8(raw)
        .map(Value::Text)
        .map_err(|e| Error::DecodingFailure(format!("payload is not valid UTF-8: {e}")))
}
