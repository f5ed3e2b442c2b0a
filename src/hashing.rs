//! Hashing System - SHA-256 Fingerprints
//!
//! Identical inputs must produce identical digests, so a rendered config
//! can be traced back to the value set that produced it.

use sha2::{Digest, Sha256};
use serde::Serialize;
use serde_json::{to_string, Value};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Digest of rendered document text
pub fn document_digest(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Digest of the inputs of a render
/// values_digest = sha256(template_id + template_version + canonical_values)
pub fn values_digest(
    template_id: &str,
    template_version: &str,
    values: &impl Serialize,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(values)?;
    let combined = format!("{}:{}:{}", template_id, template_version, canonical);
    Ok(sha256_hex(combined.as_bytes()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_document_digest_known_value() {
        assert_eq!(
            document_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_values_digest_tracks_template() {
        let values = json!({"PORT": 8080, "ADDRESS": "localhost"});
        let a = values_digest("dashboard", "1.0.0", &values).unwrap();
        let b = values_digest("dashboard", "1.0.0", &values).unwrap();
        let c = values_digest("dashboard", "1.1.0", &values).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
