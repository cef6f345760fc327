//! Read-only verification of a conversion.

use serde::{Deserialize, Serialize};

use super::{TableConverter, decompressed_text};
use crate::Error;
use crate::cache::compression::CompressionService;
use crate::cache::tables::{self, RawRow, payload_bytes};

/// Per-row verification counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub checked: usize,
    pub matched: usize,
    pub mismatched: usize,
    /// Source rows with no counterpart in the target table.
    pub missing: usize,
    /// Rows whose compressed side could not be decoded.
    pub errors: usize,
}

impl ValidationStats {
    fn add(&mut self, other: &ValidationStats) {
        self.checked += other.checked;
        self.matched += other.matched;
        self.mismatched += other.mismatched;
        self.missing += other.missing;
        self.errors += other.errors;
    }

    /// Every checked row matched.
    pub fn is_clean(&self) -> bool {
        self.matched == self.checked
    }
}

impl TableConverter {
    /// Compare the batch of source rows at `offset` against the target table.
    ///
    /// The compressed side is decompressed before comparing; `id`,
    /// `response_size` and the processing markers are ignored. Nothing is
    /// written.
    pub async fn validate_batch(&self, offset: usize) -> Result<ValidationStats, Error> {
        self.repository.ensure_tables(&self.client).await?;

        let source = self.source.clone();
        let target = self.target.clone();
        let client = self.client.clone();
        let batch_size = self.options.batch_size;
        let source_is_compressed = self.direction.source_is_compressed();
        let compression = self.repository.compression.clone();

        let (stats, fetched) = self
            .repository
            .db
            .conn
            .call(move |conn| -> Result<(ValidationStats, usize), Error> {
                let rows = tables::page(conn, &source, &client, batch_size, offset)?;
                let fetched = rows.len();
                let mut stats = ValidationStats::default();

                for row in rows {
                    stats.checked += 1;
                    let Some(counterpart) = tables::find_by_key(conn, &target, &row.key)? else {
                        tracing::warn!(key = %row.key, table = %target, "row missing from target");
                        stats.missing += 1;
                        continue;
                    };

                    let (plain, packed) = if source_is_compressed { (counterpart, row) } else { (row, counterpart) };
                    let key = plain.key.clone();
                    match decompress_row(packed, &compression) {
                        Ok(unpacked) => {
                            let diffs = plain.differences(&unpacked);
                            if diffs.is_empty() {
                                stats.matched += 1;
                            } else {
                                tracing::warn!(key = %key, fields = ?diffs, "row mismatch");
                                stats.mismatched += 1;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "failed to decode compressed row");
                            stats.errors += 1;
                        }
                    }
                }

                Ok((stats, fetched))
            })
            .await
            .map_err(Error::from)?;

        tracing::info!(
            client = %self.client,
            offset,
            fetched,
            matched = stats.matched,
            mismatched = stats.mismatched,
            missing = stats.missing,
            errors = stats.errors,
            "validated batch"
        );
        Ok(stats)
    }

    /// Validate every row of the source table.
    pub async fn validate_all(&self) -> Result<ValidationStats, Error> {
        let mut totals = ValidationStats::default();
        let mut offset = 0;
        loop {
            let batch = self.validate_batch(offset).await?;
            if batch.checked == 0 {
                break;
            }
            totals.add(&batch);
            offset += batch.checked;
            if batch.checked < self.options.batch_size {
                break;
            }
        }
        Ok(totals)
    }
}

fn decompress_row(mut row: RawRow, compression: &CompressionService) -> Result<RawRow, Error> {
    for payload in [&mut row.request_headers, &mut row.request_body, &mut row.response_headers, &mut row.response_body] {
        if let Some(bytes) = payload_bytes(payload) {
            *payload = decompressed_text(bytes, compression)?;
        }
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::{repo, seed};
    use crate::convert::{ConvertOptions, Direction};

    fn options(batch_size: usize) -> ConvertOptions {
        ConvertOptions { batch_size, ..Default::default() }
    }

    #[tokio::test]
    async fn test_validate_after_compress() {
        let repo = repo(false).await;
        seed(&repo, 5).await;
        let converter = TableConverter::new(repo, "acme", Direction::Compress, options(2)).unwrap();
        converter.convert_all().await.unwrap();

        let stats = converter.validate_all().await.unwrap();
        assert_eq!(stats, ValidationStats { checked: 5, matched: 5, mismatched: 0, missing: 0, errors: 0 });
        assert!(stats.is_clean());
    }

    #[tokio::test]
    async fn test_validate_after_decompress() {
        let repo = repo(true).await;
        seed(&repo, 3).await;
        let converter = TableConverter::new(repo, "acme", Direction::Decompress, options(10)).unwrap();
        converter.convert_all().await.unwrap();

        let stats = converter.validate_all().await.unwrap();
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.mismatched, 0);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_validate_reports_missing_and_mismatch() {
        let repo = repo(false).await;
        seed(&repo, 3).await;
        let converter = TableConverter::new(repo.clone(), "acme", Direction::Compress, options(10)).unwrap();
        converter.convert_all().await.unwrap();

        repo.db
            .conn
            .call(|conn| {
                conn.execute("DELETE FROM api_cache_acme_responses_compressed WHERE key = 'acme.get.search.0'", [])?;
                conn.execute(
                    "UPDATE api_cache_acme_responses SET endpoint = 'changed' WHERE key = 'acme.get.search.1'",
                    [],
                )
            })
            .await
            .unwrap();

        let stats = converter.validate_all().await.unwrap();
        assert_eq!(stats, ValidationStats { checked: 3, matched: 1, mismatched: 1, missing: 1, errors: 0 });
        assert!(!stats.is_clean());
    }

    #[tokio::test]
    async fn test_validate_reports_decode_errors() {
        let repo = repo(false).await;
        seed(&repo, 2).await;
        let converter = TableConverter::new(repo.clone(), "acme", Direction::Compress, options(10)).unwrap();
        converter.convert_all().await.unwrap();

        repo.db
            .conn
            .call(|conn| {
                conn.execute(
                    "UPDATE api_cache_acme_responses_compressed SET response_body = X'DEADBEEF' WHERE key = 'acme.get.search.1'",
                    [],
                )
            })
            .await
            .unwrap();

        let stats = converter.validate_all().await.unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_validate_does_not_write() {
        let repo = repo(false).await;
        seed(&repo, 2).await;
        let converter = TableConverter::new(repo.clone(), "acme", Direction::Compress, options(10)).unwrap();

        let stats = converter.validate_all().await.unwrap();
        assert_eq!(stats.missing, 2);

        let packed = crate::cache::tables::table_name("acme", true).unwrap();
        let count: i64 = repo
            .db
            .conn
            .call(move |conn| conn.query_row(&format!("SELECT COUNT(*) FROM {packed}"), [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
