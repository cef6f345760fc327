//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use std::collections::HashMap;

use crate::cache::tables;
use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

/// Longest TTL accepted from configuration (100 years).
pub const MAX_TTL_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Longest attempt window accepted from configuration (1 year).
pub const MAX_DECAY_SECONDS: u64 = 365 * 24 * 60 * 60;

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `compression_level` exceeds 9
    /// - `batch_size` or `summary_max_length` is 0
    /// - a TTL is outside `1..=MAX_TTL_SECONDS`
    /// - a client name does not match `^[A-Za-z0-9_-]+$` or cannot name a table
    /// - two clients resolve to the same table
    /// - a client's `decay_seconds` is outside `1..=MAX_DECAY_SECONDS`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compression_level > 9 {
            return Err(ConfigError::Invalid { field: "compression_level".into(), reason: "must be 0-9".into() });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::Invalid { field: "batch_size".into(), reason: "must be greater than 0".into() });
        }

        if self.summary_max_length == 0 {
            return Err(ConfigError::Invalid {
                field: "summary_max_length".into(),
                reason: "must be greater than 0".into(),
            });
        }

        validate_ttl("default_ttl_seconds", self.default_ttl_seconds)?;

        let mut owners: HashMap<String, &str> = HashMap::new();
        for (name, client) in &self.clients {
            let field = format!("clients.{name}");
            let table = tables::validate_client(name)
                .and_then(|()| tables::table_name(name, false))
                .map_err(|e| ConfigError::Invalid { field: field.clone(), reason: e.to_string() })?;
            if let Some(other) = owners.insert(table.clone(), name) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("resolves to table {table}, already used by client '{other}'"),
                });
            }

            if !(1..=MAX_DECAY_SECONDS).contains(&client.decay_seconds) {
                return Err(ConfigError::Invalid {
                    field: format!("{field}.decay_seconds"),
                    reason: format!("must be between 1 and {MAX_DECAY_SECONDS}"),
                });
            }
            validate_ttl(&format!("{field}.default_ttl_seconds"), client.default_ttl_seconds)?;
            if client.max_attempts == Some(0) {
                tracing::warn!(client = %name, "max_attempts is 0; every uncached request will be refused");
            }
        }

        Ok(())
    }
}

fn validate_ttl(field: &str, ttl: Option<i64>) -> Result<(), ConfigError> {
    match ttl {
        Some(ttl) if !(1..=MAX_TTL_SECONDS).contains(&ttl) => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("must be between 1 and {MAX_TTL_SECONDS}"),
        }),
        _ => Ok(()),
    }
}
