//! Per-client attempt quota over a fixed decay window.
//!
//! Each client gets `max_attempts` per window of `decay_seconds`. Once the
//! window is used up nothing is allowed until it closes, then the full quota
//! returns at once. This is a fixed window, not a sliding window or token
//! bucket; callers that need smoother pacing layer it on top.

pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use store::{AttemptStore, MemoryAttemptStore};

use crate::Error;
use crate::config::{AppConfig, ClientConfig};

/// Client rate limiter backed by an [`AttemptStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn AttemptStore>,
    clients: Arc<BTreeMap<String, ClientConfig>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AttemptStore>, clients: BTreeMap<String, ClientConfig>) -> Self {
        Self { store, clients: Arc::new(clients) }
    }

    pub fn from_config(store: Arc<dyn AttemptStore>, config: &AppConfig) -> Self {
        Self::new(store, config.clients.clone())
    }

    fn client(&self, client: &str) -> ClientConfig {
        self.clients.get(client).cloned().unwrap_or_default()
    }

    /// Store key for a client's attempts.
    pub fn key(client: &str) -> String {
        format!("api_cache:{client}")
    }

    /// Quota per window, `None` when unlimited.
    pub fn max_attempts(&self, client: &str) -> Option<u64> {
        self.client(client)
            .max_attempts
            .and_then(|max| u64::try_from(max).ok())
    }

    /// Attempts left in the current window. Unlimited clients report `u64::MAX`.
    pub async fn remaining(&self, client: &str) -> Result<u64, Error> {
        match self.max_attempts(client) {
            Some(max) => self.store.remaining(&Self::key(client), max).await,
            None => Ok(u64::MAX),
        }
    }

    /// Whether a new attempt would be within quota.
    pub async fn allow_request(&self, client: &str) -> Result<bool, Error> {
        Ok(self.remaining(client).await? > 0)
    }

    /// Record `amount` attempts in the current window.
    pub async fn increment(&self, client: &str, amount: u64) -> Result<u64, Error> {
        let config = self.client(client);
        let count = self
            .store
            .increment(&Self::key(client), config.decay(), amount)
            .await?;
        tracing::debug!(client, attempts = count, max = ?self.max_attempts(client), "recorded attempt");
        Ok(count)
    }

    /// Seconds until the window resets, 0 when the client is not throttled.
    pub async fn available_in(&self, client: &str) -> Result<u64, Error> {
        let Some(max) = self.max_attempts(client) else {
            return Ok(0);
        };
        let key = Self::key(client);
        if !self.store.too_many_attempts(&key, max).await? {
            return Ok(0);
        }
        self.store.available_in(&key).await
    }

    /// Reset the client's window immediately.
    pub async fn clear(&self, client: &str) -> Result<(), Error> {
        self.store.clear(&Self::key(client)).await
    }
}
