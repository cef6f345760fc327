//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (APICACHE_*)
//! 2. TOML config file (if APICACHE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! Per-client settings live under `clients.<name>`. Components receive the
//! loaded config at construction time; nothing reads it from global state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (APICACHE_*)
/// 2. TOML config file (if APICACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to SQLite cache database.
    ///
    /// Set via APICACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// TTL applied when neither the caller nor the client config gives one.
    ///
    /// `None` stores entries that never expire.
    #[serde(default)]
    pub default_ttl_seconds: Option<i64>,

    /// gzip level (0-9) used for compressed payloads.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Maximum length of the stored request parameter summary.
    #[serde(default = "default_summary_max_length")]
    pub summary_max_length: usize,

    /// Rows per transaction for table conversion.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-client settings keyed by client name.
    #[serde(default)]
    pub clients: BTreeMap<String, ClientConfig>,
}

/// Settings for a single API client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Store this client's payloads gzip-compressed.
    #[serde(default)]
    pub compression_enabled: bool,

    /// Attempts allowed per decay window. `None` or negative means unlimited.
    #[serde(default)]
    pub max_attempts: Option<i64>,

    /// Length of the fixed attempt window in seconds.
    #[serde(default = "default_decay_seconds")]
    pub decay_seconds: u64,

    /// TTL override for this client's entries.
    #[serde(default)]
    pub default_ttl_seconds: Option<i64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./apicache.sqlite")
}

fn default_compression_level() -> u32 {
    6
}

fn default_summary_max_length() -> usize {
    255
}

fn default_batch_size() -> usize {
    100
}

fn default_decay_seconds() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            default_ttl_seconds: None,
            compression_level: default_compression_level(),
            summary_max_length: default_summary_max_length(),
            batch_size: default_batch_size(),
            clients: BTreeMap::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { compression_enabled: false, max_attempts: None, decay_seconds: default_decay_seconds(), default_ttl_seconds: None }
    }
}

impl ClientConfig {
    /// Decay window as Duration.
    pub fn decay(&self) -> Duration {
        Duration::from_secs(self.decay_seconds)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `APICACHE_`
    /// 2. TOML file from `APICACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("APICACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("APICACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Settings for `client`, falling back to defaults for unconfigured clients.
    pub fn client(&self, client: &str) -> ClientConfig {
        self.clients.get(client).cloned().unwrap_or_default()
    }

    /// Names of every configured client.
    pub fn client_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// TTL for a store when the caller gives none.
    pub fn ttl_for(&self, client: &str) -> Option<i64> {
        self.clients
            .get(client)
            .and_then(|c| c.default_ttl_seconds)
            .or(self.default_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./apicache.sqlite"));
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.summary_max_length, 255);
        assert_eq!(config.batch_size, 100);
        assert!(config.default_ttl_seconds.is_none());
        assert!(config.clients.is_empty());
    }

    #[test]
    fn test_unknown_client_falls_back_to_defaults() {
        let config = AppConfig::default();
        let client = config.client("nobody");
        assert!(!client.compression_enabled);
        assert!(client.max_attempts.is_none());
        assert_eq!(client.decay(), Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_precedence() {
        let mut config = AppConfig { default_ttl_seconds: Some(3600), ..Default::default() };
        config
            .clients
            .insert("acme".into(), ClientConfig { default_ttl_seconds: Some(60), ..Default::default() });
        config.clients.insert("plain".into(), ClientConfig::default());

        assert_eq!(config.ttl_for("acme"), Some(60));
        assert_eq!(config.ttl_for("plain"), Some(3600));
        assert_eq!(config.ttl_for("unknown"), Some(3600));
    }

    #[test]
    fn test_clients_from_toml() {
        let toml = r#"
            compression_level = 9

            [clients.acme]
            compression_enabled = true
            max_attempts = 2

            [clients.open-data]
            decay_seconds = 10
        "#;
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();

        assert_eq!(config.compression_level, 9);
        let acme = config.client("acme");
        assert!(acme.compression_enabled);
        assert_eq!(acme.max_attempts, Some(2));
        assert_eq!(acme.decay_seconds, 60);
        assert_eq!(config.client("open-data").decay_seconds, 10);
        assert_eq!(config.client_names(), vec!["acme".to_string(), "open-data".to_string()]);
    }
}
