//! Cardinality manager: adaptive gate for per-option metric emission.
//!
//! Decides whether per-option Prometheus series for (index, expiry, strike,
//! type) may be emitted, to bound time-series explosion. Disabled by default;
//! the adaptive detail mode is honored even while disabled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{env_bool, env_f64, env_u64};
use crate::metrics::{DetailMode, MetricsRegistry};
use crate::models::OptionSide;

#[derive(Debug, Clone)]
pub struct CardinalityConfig {
    pub enabled: bool,
    /// Accept strikes within +/- window of ATM (strike units; 0 disables).
    pub atm_window: f64,
    /// Accepted emissions per second across all options (0 disables).
    pub rate_limit_per_sec: u64,
    /// Minimum absolute value change required to emit (0 disables).
    pub change_threshold: f64,
    /// Band window in strike units used when detail mode is Band.
    pub band_window: f64,
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            atm_window: 0.0,
            rate_limit_per_sec: 0,
            change_threshold: 0.0,
            band_window: 0.0,
        }
    }
}

impl CardinalityConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("G6_METRICS_CARD_ENABLED", false),
            atm_window: env_f64("G6_METRICS_CARD_ATM_WINDOW", 0.0),
            rate_limit_per_sec: env_u64("G6_METRICS_CARD_RATE_LIMIT_PER_SEC", 0),
            change_threshold: env_f64("G6_METRICS_CARD_CHANGE_THRESHOLD", 0.0),
            band_window: env_f64("G6_DETAIL_MODE_BAND_ATM_WINDOW", 0.0),
        }
    }
}

type OptionKey = (String, String, i64, OptionSide);

pub struct CardinalityManager {
    pub cfg: CardinalityConfig,
    metrics: Option<Arc<MetricsRegistry>>,
    recent_accepts: VecDeque<Instant>,
    last_value: HashMap<OptionKey, f64>,
}

impl CardinalityManager {
    pub fn new(cfg: CardinalityConfig) -> Self {
        Self {
            cfg,
            metrics: None,
            recent_accepts: VecDeque::new(),
            last_value: HashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(CardinalityConfig::from_env())
    }

    /// Attach the registry used for decision accounting and adaptive mode.
    pub fn set_metrics(&mut self, metrics: Arc<MetricsRegistry>) {
        metrics.set(
            "metric_sampling_rate_limit_per_sec",
            &["option"],
            self.cfg.rate_limit_per_sec as f64,
        );
        self.metrics = Some(metrics);
    }

    fn record_decision(&self, decision: &str, reason: &str) {
        if let Some(m) = &self.metrics {
            m.inc("metric_sampling_events", &["option", decision, reason]);
        }
    }

    fn rate_limited(&mut self, now: Instant) -> bool {
        let limit = self.cfg.rate_limit_per_sec;
        if limit == 0 {
            return false;
        }
        while let Some(front) = self.recent_accepts.front() {
            if now.duration_since(*front).as_secs_f64() > 1.0 {
                self.recent_accepts.pop_front();
            } else {
                break;
            }
        }
        self.recent_accepts.len() as u64 >= limit
    }

    /// Whether per-option metrics should be emitted for this labelset.
    ///
    /// Decision order: adaptive detail mode (evaluated even when the manager
    /// is disabled), manager-disabled auto-accept, ATM window, per-second
    /// rate limit, change threshold.
    pub fn should_emit(
        &mut self,
        index: &str,
        expiry: &str,
        strike: f64,
        side: OptionSide,
        atm_strike: Option<f64>,
        value: Option<f64>,
    ) -> bool {
        let mode = self
            .metrics
            .as_ref()
            .map(|m| m.detail_mode())
            .unwrap_or(DetailMode::Full);
        if mode == DetailMode::Agg {
            self.record_decision("reject", "detail_mode_agg");
            return false;
        }
        if mode == DetailMode::Band && self.cfg.band_window > 0.0 {
            if let Some(atm) = atm_strike {
                if (strike - atm).abs() > self.cfg.band_window {
                    self.record_decision("reject", "detail_mode_band_window");
                    if let Some(m) = &self.metrics {
                        m.inc("option_detail_band_rejections", &[index]);
                    }
                    return false;
                }
            }
        }

        if !self.cfg.enabled {
            self.record_decision("accept", "disabled");
            return true;
        }

        let now = Instant::now();

        if self.cfg.atm_window > 0.0 {
            if let Some(atm) = atm_strike {
                if (strike - atm).abs() > self.cfg.atm_window {
                    self.record_decision("reject", "atm_window");
                    return false;
                }
            }
        }

        if self.rate_limited(now) {
            self.record_decision("reject", "rate_limit");
            return false;
        }

        let key = || {
            (
                index.to_string(),
                expiry.to_string(),
                crate::strikes::strike_key(strike),
                side,
            )
        };
        if self.cfg.change_threshold > 0.0 {
            if let Some(v) = value {
                if let Some(last) = self.last_value.get(&key()) {
                    if (v - last).abs() < self.cfg.change_threshold {
                        self.record_decision("reject", "no_significant_change");
                        return false;
                    }
                }
                self.last_value.insert(key(), v);
            }
        }

        if self.cfg.rate_limit_per_sec > 0 {
            self.recent_accepts.push_back(now);
        }
        self.record_decision("accept", "passed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;

    fn with_mode(mode: DetailMode, cfg: CardinalityConfig) -> CardinalityManager {
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        metrics.set_detail_mode(mode, None);
        let mut mgr = CardinalityManager::new(cfg);
        mgr.set_metrics(metrics);
        mgr
    }

    #[test]
    fn agg_mode_rejects_even_when_manager_disabled() {
        let mut mgr = with_mode(DetailMode::Agg, CardinalityConfig::default());
        assert!(!mgr.should_emit("NIFTY", "2025-09-25", 20000.0, OptionSide::CE, Some(20000.0), None));
    }

    #[test]
    fn band_mode_rejects_out_of_window_even_when_disabled() {
        let cfg = CardinalityConfig {
            band_window: 100.0,
            ..Default::default()
        };
        let mut mgr = with_mode(DetailMode::Band, cfg);
        assert!(mgr.should_emit("NIFTY", "e", 20050.0, OptionSide::CE, Some(20000.0), None));
        assert!(!mgr.should_emit("NIFTY", "e", 20250.0, OptionSide::CE, Some(20000.0), None));
    }

    #[test]
    fn disabled_manager_accepts_in_full_mode() {
        let mut mgr = with_mode(DetailMode::Full, CardinalityConfig::default());
        assert!(mgr.should_emit("NIFTY", "e", 25000.0, OptionSide::PE, None, None));
    }

    #[test]
    fn own_atm_window_applies_when_enabled() {
        let cfg = CardinalityConfig {
            enabled: true,
            atm_window: 100.0,
            ..Default::default()
        };
        let mut mgr = with_mode(DetailMode::Full, cfg);
        assert!(mgr.should_emit("NIFTY", "e", 20050.0, OptionSide::CE, Some(20000.0), None));
        assert!(!mgr.should_emit("NIFTY", "e", 20500.0, OptionSide::CE, Some(20000.0), None));
    }

    #[test]
    fn rate_limit_caps_acceptances_per_second() {
        let cfg = CardinalityConfig {
            enabled: true,
            rate_limit_per_sec: 2,
            ..Default::default()
        };
        let mut mgr = with_mode(DetailMode::Full, cfg);
        assert!(mgr.should_emit("NIFTY", "e", 20000.0, OptionSide::CE, None, None));
        assert!(mgr.should_emit("NIFTY", "e", 20050.0, OptionSide::CE, None, None));
        assert!(!mgr.should_emit("NIFTY", "e", 20100.0, OptionSide::CE, None, None));
    }

    #[test]
    fn change_threshold_suppresses_small_moves() {
        let cfg = CardinalityConfig {
            enabled: true,
            change_threshold: 0.5,
            ..Default::default()
        };
        let mut mgr = with_mode(DetailMode::Full, cfg);
        assert!(mgr.should_emit("NIFTY", "e", 20000.0, OptionSide::CE, None, Some(100.0)));
        assert!(!mgr.should_emit("NIFTY", "e", 20000.0, OptionSide::CE, None, Some(100.2)));
        assert!(mgr.should_emit("NIFTY", "e", 20000.0, OptionSide::CE, None, Some(101.0)));
    }
}
