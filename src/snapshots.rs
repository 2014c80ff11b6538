//! Bounded cache of the latest per-(index, rule) expiry snapshots.
//!
//! Feature-gated by `G6_SNAPSHOT_CACHE`; serves the `/snapshots` endpoint.
//! Guarded by a single lock; snapshots are replaced wholesale per key.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{env_bool, env_usize};
use crate::models::{ExpiryRule, ExpirySnapshot, OverviewSnapshot};

pub struct SnapshotCache {
    enabled: bool,
    max_entries: usize,
    inner: Mutex<HashMap<(String, ExpiryRule), ExpirySnapshot>>,
}

impl SnapshotCache {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        Self {
            enabled,
            max_entries: max_entries.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env_bool("G6_SNAPSHOT_CACHE", false),
            env_usize("G6_SNAPSHOT_CACHE_MAX", 64),
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, snapshot: ExpirySnapshot) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        let key = (snapshot.index.clone(), snapshot.expiry_rule);
        if inner.len() >= self.max_entries && !inner.contains_key(&key) {
            // At capacity with a new key: drop an arbitrary stale entry.
            if let Some(old_key) = inner.keys().next().cloned() {
                inner.remove(&old_key);
            }
        }
        inner.insert(key, snapshot);
    }

    pub fn snapshots(&self, index_filter: Option<&str>) -> Vec<ExpirySnapshot> {
        let inner = self.inner.lock();
        let mut out: Vec<ExpirySnapshot> = inner
            .values()
            .filter(|s| index_filter.map(|ix| s.index == ix).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (&a.index, a.expiry_date, a.expiry_rule.as_str())
                .cmp(&(&b.index, b.expiry_date, b.expiry_rule.as_str()))
        });
        out
    }

    pub fn overview(&self, index_filter: Option<&str>) -> OverviewSnapshot {
        OverviewSnapshot::from_expiry_snapshots(&self.snapshots(index_filter))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

lazy_static! {
    static ref GLOBAL_SNAPSHOTS: Arc<SnapshotCache> = Arc::new(SnapshotCache::from_env());
}

pub fn get_snapshot_cache() -> Arc<SnapshotCache> {
    GLOBAL_SNAPSHOTS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn snap(index: &str, rule: ExpiryRule, options: usize) -> ExpirySnapshot {
        ExpirySnapshot {
            index: index.to_string(),
            expiry_rule: rule,
            expiry_date: NaiveDate::from_ymd_opt(2025, 9, 25).unwrap(),
            atm_strike: 20000.0,
            options: (0..options)
                .map(|i| crate::models::OptionQuote {
                    symbol: format!("{index}25SEP{}CE", 20000 + i * 50),
                    exchange: "NFO".into(),
                    last_price: 10.0,
                    volume: 1,
                    oi: 1,
                    avg_price: Some(10.0),
                    timestamp: None,
                    strike: 20000.0 + i as f64 * 50.0,
                    side: crate::models::OptionSide::CE,
                    iv: None,
                    greeks: None,
                })
                .collect(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn disabled_cache_records_nothing() {
        let cache = SnapshotCache::new(false, 8);
        cache.record(snap("NIFTY", ExpiryRule::ThisWeek, 2));
        assert!(cache.is_empty());
    }

    #[test]
    fn latest_snapshot_wins_per_key() {
        let cache = SnapshotCache::new(true, 8);
        cache.record(snap("NIFTY", ExpiryRule::ThisWeek, 2));
        cache.record(snap("NIFTY", ExpiryRule::ThisWeek, 5));
        let got = cache.snapshots(Some("NIFTY"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].option_count(), 5);
    }

    #[test]
    fn index_filter_and_overview() {
        let cache = SnapshotCache::new(true, 8);
        cache.record(snap("NIFTY", ExpiryRule::ThisWeek, 2));
        cache.record(snap("BANKNIFTY", ExpiryRule::ThisWeek, 3));
        assert_eq!(cache.snapshots(None).len(), 2);
        assert_eq!(cache.snapshots(Some("NIFTY")).len(), 1);
        let overview = cache.overview(None);
        assert_eq!(overview.total_indices, 2);
        assert_eq!(overview.total_options, 5);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = SnapshotCache::new(true, 2);
        cache.record(snap("NIFTY", ExpiryRule::ThisWeek, 1));
        cache.record(snap("NIFTY", ExpiryRule::NextWeek, 1));
        cache.record(snap("BANKNIFTY", ExpiryRule::ThisWeek, 1));
        assert_eq!(cache.len(), 2);
    }
}
