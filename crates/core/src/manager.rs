//! Request lifecycle over the cache and the rate limiter.
//!
//! [`ApiCacheManager`] is the surface API client collaborators use: key
//! generation, cache lookup and storage, and the per-client attempt quota.
//! [`ApiCacheManager::serve`] runs the whole lifecycle for one request:
//!
//! 1. build the cache key and return a live cache entry if there is one
//! 2. refuse with `RateLimitExceeded` if the client's window is used up
//! 3. run the caller's network call and count the attempt, whatever its outcome
//! 4. store 2xx responses; anything else is returned uncached
//!
//! Identical requests in flight in the same process share a lock, so only
//! one of them reaches the network; the rest re-read the cache.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::Error;
use crate::cache::params::{normalize_params, params_summary};
use crate::cache::{ApiResult, CacheDb, CacheEntry, CacheRepository, StoreMetadata, generate_cache_key};
use crate::config::AppConfig;
use crate::ratelimit::{AttemptStore, MemoryAttemptStore, RateLimiter};

/// Optional fields for [`ApiCacheManager::store_response`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// API version, also part of the cache key.
    pub version: Option<String>,
    /// Seconds to keep the entry. Falls back to the client, then global, default.
    pub ttl: Option<i64>,
    pub attributes: Option<String>,
    pub credits: Option<i64>,
    pub cost: Option<f64>,
}

/// A cache hit as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    #[serde(flatten)]
    pub entry: CacheEntry,
    pub is_cached: bool,
}

/// One logical API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub client: String,
    pub endpoint: String,
    pub method: String,
    pub params: Value,
    #[serde(default)]
    pub options: StoreOptions,
}

impl ApiRequest {
    /// A `GET` request with no parameters.
    pub fn new(client: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            endpoint: endpoint.into(),
            method: "GET".to_string(),
            params: Value::Object(Default::default()),
            options: StoreOptions::default(),
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = Some(version.into());
        self
    }

    pub fn ttl(mut self, seconds: i64) -> Self {
        self.options.ttl = Some(seconds);
        self
    }

    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of [`ApiCacheManager::serve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Served {
    /// Answered from the cache; no attempt was counted.
    Cached(CachedResponse),
    /// Answered by the network call.
    Fresh { cache_key: String, result: ApiResult, stored: bool },
}

impl Served {
    pub fn is_cached(&self) -> bool {
        matches!(self, Served::Cached(_))
    }

    pub fn cache_key(&self) -> &str {
        match self {
            Served::Cached(hit) => &hit.entry.key,
            Served::Fresh { cache_key, .. } => cache_key,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Served::Cached(hit) => &hit.entry.response_body,
            Served::Fresh { result, .. } => &result.response.body,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Served::Cached(hit) => hit.entry.response_status_code.and_then(|c| u16::try_from(c).ok()),
            Served::Fresh { result, .. } => Some(result.response.status_code),
        }
    }
}

/// A caller's place in the queue for one cache key.
///
/// The map entry is removed when the last holder drops its slot, including
/// when a `serve` future is cancelled mid-wait.
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn join(map: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = map.entry(key.to_string()).or_default().clone();
        Self { map, key, lock }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // The map and this slot hold the only two references.
        self.map
            .remove_if(self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
    }
}

/// Cache and quota front door for API client collaborators.
#[derive(Debug, Clone)]
pub struct ApiCacheManager {
    config: Arc<AppConfig>,
    repository: CacheRepository,
    limiter: RateLimiter,
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ApiCacheManager {
    pub fn new(config: AppConfig, repository: CacheRepository, limiter: RateLimiter) -> Self {
        Self { config: Arc::new(config), repository, limiter, in_flight: Arc::new(DashMap::new()) }
    }

    /// Build a manager over `db` with an in-process attempt store.
    pub fn from_config(config: AppConfig, db: CacheDb) -> Self {
        Self::with_store(config, db, Arc::new(MemoryAttemptStore::new()))
    }

    /// Build a manager over `db` with a caller-provided attempt store.
    pub fn with_store(config: AppConfig, db: CacheDb, store: Arc<dyn AttemptStore>) -> Self {
        let repository = CacheRepository::from_config(db, &config);
        let limiter = RateLimiter::from_config(store, &config);
        Self::new(config, repository, limiter)
    }

    pub fn repository(&self) -> &CacheRepository {
        &self.repository
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn generate_cache_key<T: Serialize + ?Sized>(
        &self, client: &str, endpoint: &str, params: &T, method: &str, version: Option<&str>,
    ) -> Result<String, Error> {
        generate_cache_key(client, endpoint, params, method, version)
    }

    /// Table that currently serves `client`.
    pub fn get_table_name(&self, client: &str) -> Result<String, Error> {
        self.repository.table_name(client)
    }

    /// Live cache entry for `key`, tagged as cached.
    pub async fn get_cached_response(&self, client: &str, key: &str) -> Result<Option<CachedResponse>, Error> {
        let entry = self.repository.get(client, key).await?;
        if entry.is_some() {
            tracing::debug!(client, key, "cache hit");
        }
        Ok(entry.map(|entry| CachedResponse { entry, is_cached: true }))
    }

    /// Store a network result under `key`.
    pub async fn store_response<T: Serialize + ?Sized>(
        &self, client: &str, key: &str, params: &T, result: &ApiResult, endpoint: &str, options: &StoreOptions,
    ) -> Result<(), Error> {
        let normalized = normalize_params(params)?;
        let summary = params_summary(&normalized, self.config.summary_max_length)?;

        let metadata = StoreMetadata {
            version: options.version.clone(),
            endpoint: Some(endpoint.to_string()),
            base_url: result.request.base_url.clone(),
            full_url: result.request.full_url.clone(),
            method: result.request.method.clone(),
            attributes: options.attributes.clone(),
            credits: options.credits,
            cost: options.cost,
            request_params_summary: Some(summary),
            request_headers: result.request.headers.clone(),
            request_body: result.request.body.clone(),
            response_headers: result.response.headers.clone(),
            response_body: Some(result.response.body.clone()),
            response_status_code: Some(i64::from(result.response.status_code)),
            response_time: result.response.time,
        };

        let ttl = options.ttl.or_else(|| self.config.ttl_for(client));
        self.repository.store(client, key, metadata, ttl).await
    }

    pub async fn allow_request(&self, client: &str) -> Result<bool, Error> {
        self.limiter.allow_request(client).await
    }

    pub async fn get_remaining_attempts(&self, client: &str) -> Result<u64, Error> {
        self.limiter.remaining(client).await
    }

    pub async fn get_available_in(&self, client: &str) -> Result<u64, Error> {
        self.limiter.available_in(client).await
    }

    pub async fn increment_attempts(&self, client: &str, amount: u64) -> Result<u64, Error> {
        self.limiter.increment(client, amount).await
    }

    pub async fn clear_rate_limit(&self, client: &str) -> Result<(), Error> {
        self.limiter.clear(client).await
    }

    /// Serve `request` from the cache, or through `dispatch` when it misses.
    ///
    /// # Errors
    ///
    /// - `RateLimitExceeded` when the cache misses and the client has no attempts left
    /// - `Dispatch` when `dispatch` fails (the attempt is still counted)
    /// - key generation and lookup errors
    ///
    /// Storage failures after a successful call are logged and the result is
    /// returned uncached.
    pub async fn serve<F, Fut, E>(&self, request: &ApiRequest, dispatch: F) -> Result<Served, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ApiResult, E>>,
        E: Display,
    {
        let client = request.client.as_str();
        let key = self.generate_cache_key(
            client,
            &request.endpoint,
            &request.params,
            &request.method,
            request.options.version.as_deref(),
        )?;

        if let Some(hit) = self.get_cached_response(client, &key).await? {
            return Ok(Served::Cached(hit));
        }

        let slot = InFlight::join(&self.in_flight, &key);
        let _turn = slot.lock.lock().await;
        self.serve_miss(request, &key, dispatch).await
    }

    async fn serve_miss<F, Fut, E>(&self, request: &ApiRequest, key: &str, dispatch: F) -> Result<Served, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ApiResult, E>>,
        E: Display,
    {
        let client = request.client.as_str();

        // Another caller may have filled the entry while we waited.
        if let Some(hit) = self.get_cached_response(client, key).await? {
            return Ok(Served::Cached(hit));
        }

        if !self.allow_request(client).await? {
            let available_in = self.get_available_in(client).await?;
            tracing::warn!(client, available_in, "rate limit exceeded");
            return Err(Error::RateLimitExceeded { client: client.to_string(), available_in });
        }

        let outcome = dispatch().await;

        if let Err(e) = self.increment_attempts(client, 1).await {
            tracing::warn!(client, error = %e, "failed to record attempt");
        }

        let mut result = outcome.map_err(|e| Error::Dispatch(e.to_string()))?;
        if result.request.method.is_none() {
            result.request.method = Some(request.method.to_uppercase());
        }

        let stored = if result.is_success() {
            match self
                .store_response(client, key, &request.params, &result, &request.endpoint, &request.options)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(client, key, error = %e, "failed to cache response");
                    false
                }
            }
        } else {
            tracing::warn!(client, key, status = result.response.status_code, "not caching unsuccessful response");
            false
        };

        Ok(Served::Fresh { cache_key: key.to_string(), result, stored })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn manager(max_attempts: Option<i64>, compression_enabled: bool) -> ApiCacheManager {
        let mut config = AppConfig::default();
        config.clients.insert(
            "acme".to_string(),
            ClientConfig { max_attempts, compression_enabled, decay_seconds: 60, default_ttl_seconds: None },
        );
        let db = CacheDb::open_in_memory().await.unwrap();
        ApiCacheManager::from_config(config, db)
    }

    fn ok(body: &str) -> Result<ApiResult, String> {
        Ok(ApiResult::new(200, body))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let manager = manager(Some(10), false).await;
        let request = ApiRequest::new("acme", "/search").params(json!({ "q": "rust" }));

        let first = manager.serve(&request, || async { ok("fresh") }).await.unwrap();
        assert!(!first.is_cached());
        assert!(matches!(first, Served::Fresh { stored: true, .. }));

        let second = manager
            .serve(&request, || async { Err::<ApiResult, _>("network must not be called") })
            .await
            .unwrap();
        assert!(second.is_cached());
        assert_eq!(second.body(), "fresh");
        assert_eq!(second.cache_key(), first.cache_key());
        assert_eq!(manager.get_remaining_attempts("acme").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_cached_flag_only_on_manager_results() {
        let manager = manager(None, true).await;
        let key = manager.generate_cache_key("acme", "items", &json!({}), "GET", None).unwrap();
        manager
            .store_response("acme", &key, &json!({}), &ApiResult::new(200, "[1,2]"), "items", &StoreOptions::default())
            .await
            .unwrap();

        let hit = manager.get_cached_response("acme", &key).await.unwrap().unwrap();
        assert!(hit.is_cached);
        assert_eq!(hit.entry.response_body, "[1,2]");

        let as_json = serde_json::to_value(&hit).unwrap();
        assert_eq!(as_json["is_cached"], json!(true));
        assert_eq!(as_json["response_body"], json!("[1,2]"));
    }

    #[tokio::test]
    async fn test_rate_limited_after_quota() {
        let manager = manager(Some(1), false).await;
        let first = ApiRequest::new("acme", "search").params(json!({ "q": "a" }));
        let second = ApiRequest::new("acme", "search").params(json!({ "q": "b" }));

        manager.serve(&first, || async { ok("a") }).await.unwrap();
        let result = manager.serve(&second, || async { ok("b") }).await;
        match result {
            Err(Error::RateLimitExceeded { client, available_in }) => {
                assert_eq!(client, "acme");
                assert!(available_in > 0 && available_in <= 60);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let hit = manager.serve(&first, || async { ok("unused") }).await.unwrap();
        assert!(hit.is_cached());
    }

    #[tokio::test]
    async fn test_failed_call_counts_but_is_not_cached() {
        let manager = manager(Some(5), false).await;
        let request = ApiRequest::new("acme", "search").params(json!({ "q": "down" }));

        let served = manager
            .serve(&request, || async { Ok::<_, String>(ApiResult::new(503, "unavailable")) })
            .await
            .unwrap();
        assert!(matches!(served, Served::Fresh { stored: false, .. }));
        assert_eq!(served.status_code(), Some(503));
        assert_eq!(manager.get_remaining_attempts("acme").await.unwrap(), 4);
        assert_eq!(manager.repository().count_total_responses("acme").await.unwrap(), 0);

        let dispatched = manager.serve(&request, || async { ok("back") }).await.unwrap();
        assert!(!dispatched.is_cached());
        assert_eq!(manager.get_remaining_attempts("acme").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_error_counts_attempt() {
        let manager = manager(Some(5), false).await;
        let request = ApiRequest::new("acme", "search");

        let result = manager
            .serve(&request, || async { Err::<ApiResult, _>("connection reset") })
            .await;
        assert!(matches!(result, Err(Error::Dispatch(msg)) if msg == "connection reset"));
        assert_eq!(manager.get_remaining_attempts("acme").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_storage_failure_is_swallowed() {
        let manager = manager(Some(5), false).await;
        let request = ApiRequest::new("acme", "search");

        let served = manager.serve(&request, || async { ok("") }).await.unwrap();
        assert!(matches!(served, Served::Fresh { stored: false, .. }));
        assert_eq!(served.body(), "");
    }

    #[tokio::test]
    async fn test_concurrent_identical_misses_dispatch_once() {
        let manager = manager(None, false).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let request = ApiRequest::new("acme", "search").params(json!({ "q": "same" }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .serve(&request, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        ok("shared")
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut cached = 0;
        for handle in handles {
            let served = handle.await.unwrap();
            assert_eq!(served.body(), "shared");
            if served.is_cached() {
                cached += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached, 7);
        assert!(manager.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_serve_releases_in_flight_slot() {
        let manager = manager(None, false).await;
        let request = ApiRequest::new("acme", "slow");
        let key = manager.generate_cache_key("acme", "slow", &json!({}), "GET", None).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let manager = manager.clone();
            let request = request.clone();
            tasks.push(tokio::spawn(async move {
                manager.serve(&request, std::future::pending::<Result<ApiResult, String>>).await
            }));
        }

        // One task is dispatching and the other is queued behind it.
        while manager.in_flight.get(&key).map(|lock| Arc::strong_count(lock.value())) != Some(3) {
            tokio::task::yield_now().await;
        }

        for task in tasks {
            task.abort();
            assert!(task.await.unwrap_err().is_cancelled());
        }
        assert!(manager.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_not_cached() {
        let manager = manager(None, false).await;
        let request = ApiRequest::new("acme", "search").ttl(i64::MAX);

        let served = manager.serve(&request, || async { ok("fresh") }).await.unwrap();
        assert!(matches!(served, Served::Fresh { stored: false, .. }));

        let result = manager
            .store_response("acme", served.cache_key(), &json!({}), &ApiResult::new(200, "ok"), "search", &request.options)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_store_response_uses_default_ttl() {
        let mut config = AppConfig { default_ttl_seconds: Some(3600), ..Default::default() };
        config.clients.insert("acme".into(), ClientConfig::default());
        let manager = ApiCacheManager::from_config(config, CacheDb::open_in_memory().await.unwrap());

        let key = manager.generate_cache_key("acme", "x", &json!({ "a": 1 }), "GET", Some("v1")).unwrap();
        let options = StoreOptions { version: Some("v1".into()), credits: Some(3), ..Default::default() };
        manager
            .store_response("acme", &key, &json!({ "a": 1 }), &ApiResult::new(200, "ok"), "x", &options)
            .await
            .unwrap();

        let entry = manager.get_cached_response("acme", &key).await.unwrap().unwrap().entry;
        assert!(entry.expires_at.is_some());
        assert_eq!(entry.version.as_deref(), Some("v1"));
        assert_eq!(entry.credits, Some(3));
        assert_eq!(entry.request_params_summary.as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_table_name_follows_compression() {
        let packed = manager(None, true).await;
        assert_eq!(packed.get_table_name("acme").unwrap(), "api_cache_acme_responses_compressed");
        let plain = manager(None, false).await;
        assert_eq!(plain.get_table_name("acme").unwrap(), "api_cache_acme_responses");
    }
}
