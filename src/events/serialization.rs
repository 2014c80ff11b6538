//! JSON serialization cache for repeated event payloads.
//!
//! Avoids re-serializing identical (event_type, payload) pairs across
//! consumer flushes within a cycle. Keyed by the SHA-256 of the canonical
//! (sorted-key, no-whitespace) JSON encoding; bounded with LRU eviction.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::env_usize;
use crate::metrics::MetricsRegistry;

/// Canonical JSON: object keys sorted recursively, minimal separators.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(k).unwrap_or_default());
                    out.push(':');
                    write(&map[*k], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Hex SHA-256 of the canonical JSON encoding.
pub fn stable_hash(payload: &Value) -> String {
    let blob = canonical_json(payload);
    hex::encode(Sha256::digest(blob.as_bytes()))
}

struct Entry {
    data: Arc<Vec<u8>>,
}

pub struct SerializationCache {
    max: usize,
    data: HashMap<(String, String), Entry>,
    order: Vec<(String, String)>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SerializationCache {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            data: HashMap::new(),
            order: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            metrics: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(env_usize("G6_SERIALIZATION_CACHE_MAX", 1024))
    }

    pub fn set_metrics(&mut self, metrics: Arc<MetricsRegistry>) {
        self.metrics = Some(metrics);
    }

    /// Serialized JSON bytes for (event_type, payload), cached. A zero max
    /// bypasses the cache entirely.
    pub fn get_or_build(&mut self, event_type: &str, payload: &Value) -> Arc<Vec<u8>> {
        if self.max == 0 {
            return Arc::new(serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec()));
        }
        let key = (event_type.to_string(), stable_hash(payload));
        if let Some(entry) = self.data.get(&key) {
            self.hits += 1;
            let data = entry.data.clone();
            self.touch(&key);
            self.export_metrics();
            return data;
        }
        let data = Arc::new(serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec()));
        self.misses += 1;
        self.insert(key, data.clone());
        self.export_metrics();
        data
    }

    fn touch(&mut self, key: &(String, String)) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn insert(&mut self, key: (String, String), data: Arc<Vec<u8>>) {
        self.data.insert(key.clone(), Entry { data });
        self.order.push(key);
        if self.data.len() > self.max {
            let victim = self.order.remove(0);
            if self.data.remove(&victim).is_some() {
                self.evictions += 1;
            }
        }
    }

    fn export_metrics(&self) {
        let Some(m) = &self.metrics else { return };
        m.set("serial_cache_size", &[], self.data.len() as f64);
        let total = self.hits + self.misses;
        if total > 0 {
            m.set("serial_cache_hit_ratio", &[], self.hits as f64 / total as f64);
        }
    }

    /// Record a single hit/miss event into the registry counters. Separate
    /// from `export_metrics` so callers control when counters move.
    pub fn account(&self, hit: bool) {
        if let Some(m) = &self.metrics {
            if hit {
                m.inc("serial_cache_hits", &[]);
            } else {
                m.inc("serial_cache_misses", &[]);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": [3, 2], "y": true}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":true,"z":[3,2]},"b":1}"#);
    }

    #[test]
    fn stable_hash_is_key_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(stable_hash(&a), stable_hash(&b));
        assert_ne!(stable_hash(&a), stable_hash(&json!({"x": 1, "y": 3})));
    }

    #[test]
    fn repeated_serialize_hits_cache_once_built() {
        let mut cache = SerializationCache::new(8);
        let payload = json!({"k": "v", "n": 42});
        let first = cache.get_or_build("panel_diff", &payload);
        let second = cache.get_or_build("panel_diff", &payload);
        assert_eq!(first, second);
        assert_eq!(cache.misses, 1);
        assert_eq!(cache.hits, 1);
    }

    #[test]
    fn eviction_is_lru() {
        let mut cache = SerializationCache::new(2);
        cache.get_or_build("t", &json!({"a": 1}));
        cache.get_or_build("t", &json!({"b": 2}));
        // Touch the first so the second becomes the LRU victim.
        cache.get_or_build("t", &json!({"a": 1}));
        cache.get_or_build("t", &json!({"c": 3}));
        assert_eq!(cache.evictions, 1);
        assert_eq!(cache.len(), 2);
        cache.get_or_build("t", &json!({"a": 1}));
        assert_eq!(cache.hits, 2);
    }

    #[test]
    fn zero_capacity_bypasses_cache() {
        let mut cache = SerializationCache::new(0);
        cache.get_or_build("t", &json!({"a": 1}));
        cache.get_or_build("t", &json!({"a": 1}));
        assert_eq!(cache.hits, 0);
        assert_eq!(cache.misses, 0);
        assert!(cache.is_empty());
    }
}
