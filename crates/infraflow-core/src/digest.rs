//! Canonical JSON and SHA-256 digests for attestation payloads.
//!
//! Object keys are sorted by UTF-16 code units and output is compact, so the
//! same logical value always hashes the same way.

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Compact JSON with recursively sorted keys.
pub fn canonical_json(value: &serde_json::Value) -> PipelineResult<String> {
    serde_json::to_string(&sort_keys_utf16(value))
        .map_err(|e| PipelineError::Attestation(format!("canonical json: {e}")))
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn compute_digest(value: &serde_json::Value) -> PipelineResult<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}
