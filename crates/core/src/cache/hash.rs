//! Deterministic cache key generation.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::Error;
use super::params::{canonical_json, normalize_params};
use super::tables::validate_client;

/// Hash canonical parameter JSON.
pub fn params_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the cache key for a logical request.
///
/// Layout: `{client}.{method}.{endpoint}.{params_hash}[.{version}]`, with the
/// method lowercased and leading slashes stripped from the endpoint.
pub fn generate_cache_key<T: Serialize + ?Sized>(
    client: &str, endpoint: &str, params: &T, method: &str, version: Option<&str>,
) -> Result<String, Error> {
    validate_client(client)?;

    let normalized = normalize_params(params)?;
    let hash = params_hash(&canonical_json(&normalized)?);

    let mut key = format!(
        "{client}.{}.{}.{hash}",
        method.to_lowercase(),
        endpoint.trim_start_matches('/')
    );
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        key.push('.');
        key.push_str(version);
    }

    Ok(key)
}
