//! Canonical JSON and SHA-256 digests for fix candidates and audit artifacts.
//!
//! A candidate's digest is what ties a [`ValidationReport`] to the exact set
//! of edits it validated, so the encoding must not depend on field order.
//!
//! [`ValidationReport`]: crate::domain::validation::ValidationReport

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::error::{CimendError, Result};

/// Recursively sort JSON object keys.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn reject_non_finite(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => map.values().try_for_each(reject_non_finite),
        serde_json::Value::Array(arr) => arr.iter().try_for_each(reject_non_finite),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(CimendError::NonCanonical(
                "NaN/Infinity not permitted in canonical JSON".to_string(),
            )),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Convert a JSON value to canonical form: sorted keys, compact encoding.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    reject_non_finite(value)?;
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
pub fn digest_of<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    Ok(sha256_hex(canonical_json(&json)?.as_bytes()))
}
