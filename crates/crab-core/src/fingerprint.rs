use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 over a record's serialized fields minus `excluded`, keys in sorted
/// order. Non-object records are hashed as-is.
pub fn fingerprint_excluding<T: Serialize + ?Sized>(record: &T, excluded: &[&str]) -> String {
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    let canonical = match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .filter(|(key, _)| !excluded.contains(&key.as_str()))
                .collect();
            serde_json::to_vec(&sorted)
        }
        other => serde_json::to_vec(&other),
    }
    .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}
