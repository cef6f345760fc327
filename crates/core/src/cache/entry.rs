//! Cache records and the network results they are built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached response as returned by [`super::CacheRepository::get`].
///
/// Payloads are already decompressed and headers JSON-decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub client: String,
    pub key: String,
    pub version: Option<String>,
    pub endpoint: Option<String>,
    pub base_url: Option<String>,
    pub full_url: Option<String>,
    pub method: Option<String>,
    pub attributes: Option<String>,
    pub credits: Option<i64>,
    pub cost: Option<f64>,
    pub request_params_summary: Option<String>,
    pub request_headers: Option<Value>,
    pub request_body: Option<String>,
    pub response_headers: Option<Value>,
    pub response_body: String,
    pub response_status_code: Option<i64>,
    /// Byte length of the body as stored, i.e. after compression.
    pub response_size: Option<i64>,
    /// Upstream response time in seconds.
    pub response_time: Option<f64>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processed_at: Option<String>,
    pub processed_status: Option<String>,
}

/// Everything [`super::CacheRepository::store`] writes besides client and key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub version: Option<String>,
    pub endpoint: Option<String>,
    pub base_url: Option<String>,
    pub full_url: Option<String>,
    /// Defaults to `GET`.
    pub method: Option<String>,
    pub attributes: Option<String>,
    pub credits: Option<i64>,
    pub cost: Option<f64>,
    pub request_params_summary: Option<String>,
    pub request_headers: Option<Value>,
    pub request_body: Option<String>,
    pub response_headers: Option<Value>,
    /// Required and non-empty.
    pub response_body: Option<String>,
    pub response_status_code: Option<i64>,
    pub response_time: Option<f64>,
}

/// Request half of a raw HTTP call result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub base_url: Option<String>,
    pub full_url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Value>,
    pub body: Option<String>,
}

/// Response half of a raw HTTP call result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub headers: Option<Value>,
    pub body: String,
    /// Seconds spent waiting on the upstream.
    pub time: Option<f64>,
}

/// Result of a network call performed by an API client collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    pub request: RequestMeta,
    pub response: ResponseMeta,
}

impl ApiResult {
    /// Build a result from a status code and body.
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self { request: RequestMeta::default(), response: ResponseMeta { status_code, body: body.into(), ..Default::default() } }
    }

    pub fn with_request(mut self, request: RequestMeta) -> Self {
        self.request = request;
        self
    }

    pub fn with_response_headers(mut self, headers: Value) -> Self {
        self.response.headers = Some(headers);
        self
    }

    pub fn with_time(mut self, seconds: f64) -> Self {
        self.response.time = Some(seconds);
        self
    }

    /// 2xx responses are cacheable.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_range() {
        assert!(ApiResult::new(200, "ok").is_success());
        assert!(ApiResult::new(204, "").is_success());
        assert!(!ApiResult::new(304, "").is_success());
        assert!(!ApiResult::new(429, "slow down").is_success());
        assert!(!ApiResult::new(500, "boom").is_success());
    }

    #[test]
    fn test_builder() {
        let result = ApiResult::new(200, "{}")
            .with_request(RequestMeta { method: Some("POST".into()), ..Default::default() })
            .with_response_headers(json!({ "content-type": ["application/json"] }))
            .with_time(0.25);
        assert_eq!(result.request.method.as_deref(), Some("POST"));
        assert_eq!(result.response.time, Some(0.25));
        assert!(result.response.headers.is_some());
    }
}
