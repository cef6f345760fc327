//! Request parameter normalization.
//!
//! Parameters are reduced to a canonical form before hashing: null values
//! are dropped at every level, mapping keys are sorted, and nested mappings
//! and sequences are normalized the same way. Sequence order is preserved.

use serde::Serialize;
use serde_json::{Map, Value};

use super::Error;

/// Deepest nesting accepted below the top-level mapping.
pub const MAX_DEPTH: usize = 20;

/// Normalize a parameter mapping into its canonical form.
///
/// Accepts anything that serializes to a JSON object (or to null, which
/// yields an empty mapping).
///
/// # Errors
///
/// - `UnsupportedType` if the value cannot be represented as JSON or is not a mapping
/// - `DepthExceeded` if nesting goes deeper than [`MAX_DEPTH`]
pub fn normalize_params<T: Serialize + ?Sized>(params: &T) -> Result<Map<String, Value>, Error> {
    let value = serde_json::to_value(params).map_err(|e| Error::UnsupportedType(e.to_string()))?;
    match value {
        Value::Object(map) => normalize_map(map, 0),
        Value::Null => Ok(Map::new()),
        other => Err(Error::UnsupportedType(format!(
            "parameters must be a mapping, got {}",
            kind(&other)
        ))),
    }
}

fn normalize_map(map: Map<String, Value>, depth: usize) -> Result<Map<String, Value>, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded(MAX_DEPTH));
    }

    let mut entries = map
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| Ok((k, normalize_value(v, depth)?)))
        .collect::<Result<Vec<_>, Error>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(entries.into_iter().collect())
}

fn normalize_value(value: Value, depth: usize) -> Result<Value, Error> {
    match value {
        Value::Object(map) => Ok(Value::Object(normalize_map(map, depth + 1)?)),
        Value::Array(items) => {
            if depth + 1 > MAX_DEPTH {
                return Err(Error::DepthExceeded(MAX_DEPTH));
            }
            let items = items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(|v| normalize_value(v, depth + 1))
                .collect::<Result<Vec<_>, Error>>()?;
            Ok(Value::Array(items))
        }
        scalar => Ok(scalar),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Serialize normalized parameters as compact JSON.
pub fn canonical_json(params: &Map<String, Value>) -> Result<String, Error> {
    serde_json::to_string(params).map_err(|e| Error::EncodingFailure(e.to_string()))
}

/// Human-readable projection of normalized parameters, cut to `max_len` chars.
///
/// Never used for lookup.
pub fn params_summary(params: &Map<String, Value>, max_len: usize) -> Result<String, Error> {
    let json = canonical_json(params)?;
    if json.chars().count() <= max_len {
        return Ok(json);
    }
    let keep = max_len.saturating_sub(3);
    let mut summary: String = json.chars().take(keep).collect();
    summary.push_str("...");
    Ok(summary)
}
