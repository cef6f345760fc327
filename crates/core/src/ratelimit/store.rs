//! Attempt counter backends.
//!
//! The limiter only talks to an [`AttemptStore`]; the in-memory store keeps
//! one fixed window per key and updates it under the map's shard lock, so
//! concurrent increments for a key never lose updates.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::Error;

/// Fixed-window attempt counter keyed by an arbitrary string.
#[async_trait]
pub trait AttemptStore: Send + Sync + Debug {
    /// Attempts recorded in the key's current window.
    async fn attempts(&self, key: &str) -> Result<u64, Error>;

    /// Add `amount` attempts, opening a new window of `decay` if none is active.
    ///
    /// Returns the attempt count after the increment.
    async fn increment(&self, key: &str, decay: Duration, amount: u64) -> Result<u64, Error>;

    /// Whole seconds until the key's window closes, 0 if none is active.
    async fn available_in(&self, key: &str) -> Result<u64, Error>;

    /// Drop the key's window.
    async fn clear(&self, key: &str) -> Result<(), Error>;

    /// Attempts left out of `max` in the current window.
    async fn remaining(&self, key: &str, max: u64) -> Result<u64, Error> {
        Ok(max.saturating_sub(self.attempts(key).await?))
    }

    /// Whether the key has used all `max` attempts.
    async fn too_many_attempts(&self, key: &str, max: u64) -> Result<bool, Error> {
        Ok(self.attempts(key).await? >= max)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    resets_at: Instant,
}

impl Window {
    fn is_open(&self, now: Instant) -> bool {
        now < self.resets_at
    }
}

/// Process-local attempt store.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    windows: DashMap<String, Window>,
}

/// Deadline used when `now + decay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove windows that have already closed.
    ///
    /// Runs whenever a window opens, so keys that stop being used do not
    /// accumulate.
    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| window.is_open(now));
    }

    fn open_window(&self, key: &str) -> Option<Window> {
        let now = Instant::now();
        self.windows.get(key).map(|w| *w).filter(|w| w.is_open(now))
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn attempts(&self, key: &str) -> Result<u64, Error> {
        Ok(self.open_window(key).map(|w| w.count).unwrap_or(0))
    }

    async fn increment(&self, key: &str, decay: Duration, amount: u64) -> Result<u64, Error> {
        let now = Instant::now();
        let (count, opened) = {
            let mut window = self.windows.entry(key.to_string()).or_insert(Window { count: 0, resets_at: now });
            let opened = !window.is_open(now);
            if opened {
                let resets_at = now.checked_add(decay).unwrap_or_else(|| now + FAR_FUTURE);
                *window = Window { count: amount, resets_at };
            } else {
                window.count = window.count.saturating_add(amount);
            }
            (window.count, opened)
        };

        if opened {
            self.cleanup_expired();
        }
        Ok(count)
    }

    async fn available_in(&self, key: &str) -> Result<u64, Error> {
        let Some(window) = self.open_window(key) else {
            return Ok(0);
        };
        let left = window.resets_at.saturating_duration_since(Instant::now());
        Ok(left.as_secs() + u64::from(left.subsec_nanos() > 0))
    }

    async fn clear(&self, key: &str) -> Result<(), Error> {
        self.windows.remove(key);
        Ok(())
    }
}
