//! Process-wide root detection cache.
//!
//! Avoids repeated root scans over large option universes. Bounded with a
//! batched FIFO-ish eviction (oldest ~5% dropped when full). Disable with
//! `G6_DISABLE_ROOT_CACHE=1`.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{env_bool, env_usize};
use crate::filters::symbol_root::detect_root;

#[derive(Debug, Default)]
struct RootCacheInner {
    map: HashMap<String, Option<&'static str>>,
    // Insertion order for eviction; HashMap alone loses it.
    order: Vec<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct RootCache {
    inner: Mutex<RootCacheInner>,
    max: usize,
    disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RootCacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: Option<f64>,
    pub capacity: usize,
    pub enabled: bool,
}

impl RootCache {
    pub fn new(max: usize, disabled: bool) -> Self {
        Self {
            inner: Mutex::new(RootCacheInner::default()),
            max: max.max(16),
            disabled,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env_usize("G6_ROOT_CACHE_MAX", 4096),
            env_bool("G6_DISABLE_ROOT_CACHE", false),
        )
    }

    pub fn detect(&self, tradingsymbol: &str) -> Option<&'static str> {
        if tradingsymbol.is_empty() {
            return None;
        }
        if self.disabled {
            return detect_root(tradingsymbol);
        }
        let key = tradingsymbol.trim().to_ascii_uppercase();
        {
            let mut inner = self.inner.lock();
            if let Some(root) = inner.map.get(&key).copied() {
                inner.hits += 1;
                return root;
            }
        }
        let root = detect_root(&key);
        let mut inner = self.inner.lock();
        if !inner.map.contains_key(&key) {
            if inner.map.len() >= self.max {
                let drop_n = (self.max / 20).max(1);
                let order_len = inner.order.len();
                let victims: Vec<String> = inner.order.drain(..drop_n.min(order_len)).collect();
                for v in victims {
                    if inner.map.remove(&v).is_some() {
                        inner.evictions += 1;
                    }
                }
            }
            inner.order.push(key.clone());
            inner.map.insert(key, root);
            inner.misses += 1;
        }
        root
    }

    pub fn stats(&self) -> RootCacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        RootCacheStats {
            size: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_ratio: if total > 0 {
                Some(inner.hits as f64 / total as f64)
            } else {
                None
            },
            capacity: self.max,
            enabled: !self.disabled,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }
}

lazy_static! {
    static ref GLOBAL_ROOT_CACHE: RootCache = RootCache::from_env();
}

/// Shared cached root detection used on the filter hot path.
pub fn cached_detect_root(tradingsymbol: &str) -> Option<&'static str> {
    GLOBAL_ROOT_CACHE.detect(tradingsymbol)
}

pub fn root_cache_stats() -> RootCacheStats {
    GLOBAL_ROOT_CACHE.stats()
}

pub fn clear_root_cache() {
    GLOBAL_ROOT_CACHE.clear()
}
