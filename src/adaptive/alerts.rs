//! Adaptive analytics alert guards.
//!
//! Stateful trackers fed by the analytics builders each cycle:
//! interpolation fraction streak, risk delta drift over a sliding window,
//! and bucket utilization streak. Guard state is owned here (no hidden
//! singleton); a fresh engine is a full reset.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::severity::SeverityEngine;
use super::{
    AdaptiveAlert, ALERT_BUCKET_UTIL_LOW, ALERT_INTERPOLATION_HIGH, ALERT_RISK_DELTA_DRIFT,
};
use crate::config::{env_f64, env_usize};
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub interp_threshold: f64,
    pub interp_streak: usize,
    pub drift_pct_threshold: f64,
    pub drift_window: usize,
    pub row_tolerance: f64,
    pub bucket_util_min: f64,
    pub bucket_util_streak: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            interp_threshold: 0.6,
            interp_streak: 5,
            drift_pct_threshold: 25.0,
            drift_window: 5,
            row_tolerance: 0.05,
            bucket_util_min: 0.7,
            bucket_util_streak: 5,
        }
    }
}

impl AlertConfig {
    pub fn from_env() -> Self {
        Self {
            interp_threshold: env_f64("G6_INTERP_FRACTION_ALERT_THRESHOLD", 0.6),
            interp_streak: env_usize("G6_INTERP_FRACTION_ALERT_STREAK", 5),
            drift_pct_threshold: env_f64("G6_RISK_DELTA_DRIFT_PCT", 25.0),
            drift_window: env_usize("G6_RISK_DELTA_DRIFT_WINDOW", 5),
            row_tolerance: env_f64("G6_RISK_DELTA_STABLE_ROW_TOLERANCE", 0.05),
            bucket_util_min: env_f64("G6_RISK_BUCKET_UTIL_MIN", 0.7),
            bucket_util_streak: env_usize("G6_RISK_BUCKET_UTIL_STREAK", 5),
        }
    }
}

pub struct AlertEngine {
    pub cfg: AlertConfig,
    severity: SeverityEngine,
    metrics: Option<Arc<MetricsRegistry>>,
    interp_streaks: HashMap<String, usize>,
    risk_window: VecDeque<(f64, usize)>,
    bucket_util_streak: usize,
}

impl AlertEngine {
    pub fn new(cfg: AlertConfig, severity: SeverityEngine) -> Self {
        Self {
            cfg,
            severity,
            metrics: None,
            interp_streaks: HashMap::new(),
            risk_window: VecDeque::new(),
            bucket_util_streak: 0,
        }
    }

    pub fn from_env() -> Self {
        Self::new(AlertConfig::from_env(), SeverityEngine::from_env())
    }

    pub fn set_metrics(&mut self, metrics: Arc<MetricsRegistry>) {
        self.metrics = Some(metrics);
    }

    pub fn severity_mut(&mut self) -> &mut SeverityEngine {
        &mut self.severity
    }

    pub fn severity(&self) -> &SeverityEngine {
        &self.severity
    }

    fn inc(&self, attr: &str, labels: &[&str]) {
        if let Some(m) = &self.metrics {
            m.inc(attr, labels);
        }
    }

    fn set(&self, attr: &str, labels: &[&str], value: f64) {
        if let Some(m) = &self.metrics {
            m.set(attr, labels, value);
        }
    }

    /// Interpolation guard: streak of builds with fraction above threshold.
    pub fn record_interpolation_fraction(
        &mut self,
        index: &str,
        fraction: f64,
    ) -> Option<AdaptiveAlert> {
        let streak = self.interp_streaks.entry(index.to_string()).or_insert(0);
        if fraction > self.cfg.interp_threshold {
            *streak += 1;
        } else {
            *streak = 0;
        }
        let cur = *streak;
        self.set("adaptive_interpolation_streak", &[index], cur as f64);
        if cur >= self.cfg.interp_streak && fraction > self.cfg.interp_threshold {
            self.inc("adaptive_interpolation_alerts", &[index, "high_fraction"]);
            let mut alert = AdaptiveAlert::base(
                ALERT_INTERPOLATION_HIGH,
                index,
                format!(
                    "interpolated fraction {fraction:.2} > {:.2} for {cur} consecutive builds ({index})",
                    self.cfg.interp_threshold
                ),
            );
            alert.interpolated_fraction = Some(fraction);
            self.severity.enrich(&mut alert);
            return Some(alert);
        }
        None
    }

    /// Risk delta drift: once the window is full and row counts are stable,
    /// alert when first-to-last delta notional moves past the threshold.
    pub fn record_risk_delta(
        &mut self,
        index: &str,
        delta_notional: f64,
        row_count: usize,
    ) -> Option<AdaptiveAlert> {
        self.risk_window.push_back((delta_notional, row_count));
        if self.risk_window.len() > self.cfg.drift_window {
            self.risk_window.pop_front();
        }
        if self.risk_window.len() < self.cfg.drift_window {
            return None;
        }
        let (Some(&(first_delta, first_rows)), Some(&(last_delta, last_rows))) =
            (self.risk_window.front(), self.risk_window.back())
        else {
            return None;
        };
        if first_rows > 0 {
            let row_change = (last_rows as f64 - first_rows as f64).abs() / first_rows as f64;
            if row_change > self.cfg.row_tolerance {
                return None;
            }
        }
        if first_delta == 0.0 {
            return None;
        }
        let change_pct = (last_delta - first_delta) / first_delta.abs() * 100.0;
        self.set("adaptive_risk_delta_last_change_pct", &[], change_pct.abs());
        if change_pct.abs() >= self.cfg.drift_pct_threshold {
            let sign = if change_pct > 0.0 { "up" } else { "down" };
            self.inc("adaptive_risk_delta_drift_alerts", &[sign]);
            let mut alert = AdaptiveAlert::base(
                ALERT_RISK_DELTA_DRIFT,
                index,
                format!(
                    "risk delta drift {change_pct:+.1}% over {} builds with stable rows",
                    self.cfg.drift_window
                ),
            );
            alert.drift_pct = Some(change_pct);
            alert.sign = Some(sign.to_string());
            self.severity.enrich(&mut alert);
            return Some(alert);
        }
        None
    }

    /// Bucket utilization guard: streak of builds below the minimum.
    pub fn record_bucket_util(&mut self, index: &str, utilization: f64) -> Option<AdaptiveAlert> {
        if utilization < self.cfg.bucket_util_min {
            self.bucket_util_streak += 1;
        } else {
            self.bucket_util_streak = 0;
        }
        let cur = self.bucket_util_streak;
        self.set("adaptive_bucket_util_streak", &[], cur as f64);
        if cur >= self.cfg.bucket_util_streak && utilization < self.cfg.bucket_util_min {
            self.inc("adaptive_bucket_util_alerts", &[]);
            let mut alert = AdaptiveAlert::base(
                ALERT_BUCKET_UTIL_LOW,
                index,
                format!(
                    "bucket utilization {utilization:.2} < {:.2} for {cur} consecutive builds",
                    self.cfg.bucket_util_min
                ),
            );
            alert.utilization = Some(utilization);
            self.severity.enrich(&mut alert);
            return Some(alert);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::severity::SeverityRules;

    fn engine(cfg: AlertConfig) -> AlertEngine {
        AlertEngine::new(cfg, SeverityEngine::new(true, SeverityRules::default()))
    }

    #[test]
    fn interpolation_alert_fires_at_streak_target() {
        let mut eng = engine(AlertConfig {
            interp_threshold: 0.5,
            interp_streak: 3,
            ..Default::default()
        });
        assert!(eng.record_interpolation_fraction("NIFTY", 0.4).is_none());
        assert!(eng.record_interpolation_fraction("NIFTY", 0.55).is_none());
        assert!(eng.record_interpolation_fraction("NIFTY", 0.60).is_none());
        let alert = eng
            .record_interpolation_fraction("NIFTY", 0.61)
            .expect("streak target reached");
        assert_eq!(alert.alert_type, "interpolation_high");
        assert_eq!(alert.interpolated_fraction, Some(0.61));
    }

    #[test]
    fn interpolation_streaks_are_per_index() {
        let mut eng = engine(AlertConfig {
            interp_threshold: 0.5,
            interp_streak: 2,
            ..Default::default()
        });
        assert!(eng.record_interpolation_fraction("NIFTY", 0.6).is_none());
        assert!(eng.record_interpolation_fraction("BANKNIFTY", 0.6).is_none());
        // Second above-threshold build per index fires independently.
        assert!(eng.record_interpolation_fraction("NIFTY", 0.6).is_some());
        assert!(eng.record_interpolation_fraction("BANKNIFTY", 0.6).is_some());
    }

    #[test]
    fn risk_drift_alert_with_stable_rows() {
        let mut eng = engine(AlertConfig {
            drift_window: 4,
            drift_pct_threshold: 20.0,
            row_tolerance: 0.05,
            ..Default::default()
        });
        assert!(eng.record_risk_delta("global", 1000.0, 200).is_none());
        assert!(eng.record_risk_delta("global", 1050.0, 202).is_none());
        assert!(eng.record_risk_delta("global", 1100.0, 198).is_none());
        let alert = eng
            .record_risk_delta("global", 1300.0, 199)
            .expect("drift expected");
        assert_eq!(alert.alert_type, "risk_delta_drift");
        assert_eq!(alert.sign.as_deref(), Some("up"));
        let drift = alert.drift_pct.unwrap();
        assert!((drift - 30.0).abs() < 1e-9, "drift={drift}");
    }

    #[test]
    fn risk_drift_suppressed_when_rows_unstable() {
        let mut eng = engine(AlertConfig {
            drift_window: 3,
            drift_pct_threshold: 20.0,
            row_tolerance: 0.05,
            ..Default::default()
        });
        eng.record_risk_delta("global", 1000.0, 100);
        eng.record_risk_delta("global", 1200.0, 120);
        // Row count moved 30% vs first sample: no alert despite 30% drift.
        assert!(eng.record_risk_delta("global", 1300.0, 130).is_none());
    }

    #[test]
    fn risk_drift_handles_downward_moves() {
        let mut eng = engine(AlertConfig {
            drift_window: 2,
            drift_pct_threshold: 20.0,
            row_tolerance: 0.10,
            ..Default::default()
        });
        eng.record_risk_delta("global", 1000.0, 100);
        let alert = eng.record_risk_delta("global", 700.0, 100).unwrap();
        assert_eq!(alert.sign.as_deref(), Some("down"));
        assert!(alert.drift_pct.unwrap() < 0.0);
    }

    #[test]
    fn bucket_util_streak_fires_after_target() {
        let mut eng = engine(AlertConfig {
            bucket_util_min: 0.7,
            bucket_util_streak: 3,
            ..Default::default()
        });
        assert!(eng.record_bucket_util("global", 0.5).is_none());
        assert!(eng.record_bucket_util("global", 0.6).is_none());
        let alert = eng.record_bucket_util("global", 0.4).unwrap();
        assert_eq!(alert.alert_type, "bucket_util_low");
        assert_eq!(alert.utilization, Some(0.4));
        // Recovery resets the streak.
        assert!(eng.record_bucket_util("global", 0.9).is_none());
        assert!(eng.record_bucket_util("global", 0.5).is_none());
    }
}
