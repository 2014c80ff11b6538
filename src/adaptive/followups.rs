//! Follow-up alert dispatcher.
//!
//! Wraps the three adaptive guards and enforces the alert surfacing
//! contract: suppression per (index, type) with strict-escalation bypass,
//! rolling weight pressure, a bounded recent-alert buffer for panels, and
//! `followup_alert` publication on the event bus.

use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

use super::alerts::AlertEngine;
use super::severity::Severity;
use super::AdaptiveAlert;
use crate::config::{env_bool, env_f64, env_i64, env_opt, env_usize};
use crate::events::EventBus;
use crate::metrics::{unix_now, DetailMode, MetricsRegistry};

#[derive(Debug, Clone)]
pub struct FollowupConfig {
    pub enabled: bool,
    pub suppress_seconds: f64,
    pub weight_window_seconds: f64,
    /// Weight pressure at which the detail mode is demoted one tier.
    pub demote_threshold: i64,
    pub recent_buffer_max: usize,
    /// type -> severity -> weight.
    pub weights: HashMap<String, HashMap<String, i64>>,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppress_seconds: 60.0,
            weight_window_seconds: 300.0,
            demote_threshold: 0,
            recent_buffer_max: 200,
            weights: HashMap::new(),
        }
    }
}

impl FollowupConfig {
    pub fn from_env() -> Self {
        let weights = env_opt("G6_FOLLOWUPS_WEIGHTS")
            .and_then(|raw| {
                serde_json::from_str::<HashMap<String, HashMap<String, i64>>>(&raw)
                    .map_err(|e| warn!(error = %e, "bad followup weights JSON"))
                    .ok()
            })
            .unwrap_or_default();
        Self {
            enabled: env_bool("G6_FOLLOWUPS_ENABLED", true),
            suppress_seconds: env_f64("G6_FOLLOWUPS_SUPPRESS_SECONDS", 60.0),
            weight_window_seconds: env_f64("G6_FOLLOWUPS_WEIGHT_WINDOW", 300.0),
            demote_threshold: env_i64("G6_FOLLOWUPS_DEMOTE_THRESHOLD", 0),
            recent_buffer_max: env_usize("G6_FOLLOWUPS_BUFFER_MAX", 200),
            weights,
        }
    }
}

pub struct FollowupEngine {
    pub cfg: FollowupConfig,
    guards: AlertEngine,
    metrics: Arc<MetricsRegistry>,
    bus: Option<Arc<EventBus>>,
    last_emit: HashMap<(String, String), (f64, Severity)>,
    weight_events: VecDeque<(f64, i64)>,
    recent: VecDeque<AdaptiveAlert>,
    /// Alerts accumulated since the last drain (status writer consumption).
    pending: Vec<AdaptiveAlert>,
    cycle: Option<u64>,
}

impl FollowupEngine {
    pub fn new(cfg: FollowupConfig, guards: AlertEngine, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            cfg,
            guards,
            metrics,
            bus: None,
            last_emit: HashMap::new(),
            weight_events: VecDeque::new(),
            recent: VecDeque::new(),
            pending: Vec::new(),
            cycle: None,
        }
    }

    pub fn from_env(metrics: Arc<MetricsRegistry>) -> Self {
        let mut guards = AlertEngine::from_env();
        guards.set_metrics(metrics.clone());
        Self::new(FollowupConfig::from_env(), guards, metrics)
    }

    pub fn set_bus(&mut self, bus: Arc<EventBus>) {
        self.guards.severity_mut().set_bus(bus.clone());
        self.bus = Some(bus);
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = Some(cycle);
    }

    // ------------------------------------------------------------------
    // Guard feeds
    // ------------------------------------------------------------------
    /// Surface build outputs: interpolation fraction and, when available,
    /// bucket utilization. `None` skips the corresponding guard (the risk
    /// path feeds utilization only and must not reset the interp streak).
    pub fn record_surface(
        &mut self,
        index: &str,
        interpolated_fraction: Option<f64>,
        bucket_utilization: Option<f64>,
    ) {
        if !self.cfg.enabled {
            return;
        }
        if let Some(fraction) = interpolated_fraction {
            self.metrics
                .set("followups_last_state", &[index, "interp"], fraction);
            if let Some(alert) = self.guards.record_interpolation_fraction(index, fraction) {
                self.metrics.inc("followups_interp_guard", &[index]);
                self.emit_alert(alert);
            }
        }
        if let Some(util) = bucket_utilization {
            self.metrics.set("followups_last_state", &[index, "bucket"], util);
            if let Some(alert) = self.guards.record_bucket_util(index, util) {
                self.metrics.inc("followups_bucket_coverage", &[index]);
                self.emit_alert(alert);
            }
        }
    }

    /// Risk aggregation outputs: delta notional with the row count used for
    /// the stability check.
    pub fn record_risk(&mut self, index: &str, notional_delta: f64, row_count: usize) {
        if !self.cfg.enabled {
            return;
        }
        self.metrics
            .set("followups_last_state", &[index, "risk"], notional_delta.abs());
        if let Some(alert) = self.guards.record_risk_delta(index, notional_delta, row_count) {
            let sign = alert.sign.clone().unwrap_or_else(|| "up".to_string());
            self.metrics
                .inc("followups_risk_drift", &[index, sign.as_str()]);
            self.emit_alert(alert);
        }
    }

    // ------------------------------------------------------------------
    // Emission pipeline
    // ------------------------------------------------------------------
    fn emit_alert(&mut self, mut alert: AdaptiveAlert) {
        let now = unix_now();
        let key = (alert.index.clone(), alert.alert_type.clone());
        if let Some((last_ts, last_sev)) = self.last_emit.get(&key) {
            let within = now - last_ts < self.cfg.suppress_seconds;
            // Strictly higher severity bypasses suppression.
            if within && alert.severity <= *last_sev {
                return;
            }
        }
        self.last_emit.insert(key, (now, alert.severity));
        alert.ts = now;
        alert.cycle = self.cycle;

        let weight = self.record_weight(&alert);
        alert.weight = Some(weight);
        let pressure = self.weight_pressure();

        self.pending.push(alert.clone());
        self.recent.push_back(alert.clone());
        while self.recent.len() > self.cfg.recent_buffer_max {
            self.recent.pop_front();
        }

        if let Some(bus) = &self.bus {
            let counts = self.guards.severity().active_severity_counts();
            let coalesce = format!("followup:{}:{}", alert.index, alert.alert_type);
            let payload = json!({
                "alert": &alert,
                "index": &alert.index,
                "type": &alert.alert_type,
                "severity": alert.severity.as_str(),
                "active_severity": alert.active_severity.map(|s| s.as_str()),
                "message": &alert.message,
                "ts": alert.ts,
                "cycle": alert.cycle,
                "weight": weight,
                "weight_pressure": pressure,
                "severity_counts": counts,
                "resolved": false,
            });
            if let Err(e) = bus.publish("followup_alert", payload, Some(coalesce.as_str()), None) {
                warn!(error = %e, "followup alert publish failed");
            }
        }
    }

    fn weight_for(&self, alert: &AdaptiveAlert) -> i64 {
        self.cfg
            .weights
            .get(&alert.alert_type)
            .and_then(|per_sev| per_sev.get(alert.severity.as_str()))
            .copied()
            .unwrap_or(0)
    }

    fn record_weight(&mut self, alert: &AdaptiveAlert) -> i64 {
        let w = self.weight_for(alert);
        if w <= 0 {
            return 0;
        }
        let now = unix_now();
        self.weight_events.push_back((now, w));
        self.purge_weights(now);
        w
    }

    fn purge_weights(&mut self, now: f64) {
        let cutoff = now - self.cfg.weight_window_seconds;
        while let Some((ts, _)) = self.weight_events.front() {
            if *ts < cutoff {
                self.weight_events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rolling accumulated weight inside the window; exported as a gauge.
    pub fn weight_pressure(&mut self) -> i64 {
        self.purge_weights(unix_now());
        let total: i64 = self.weight_events.iter().map(|(_, w)| w).sum();
        self.metrics.set("followups_weight_pressure", &[], total as f64);
        total
    }

    /// Demote the detail mode one tier when weight pressure crosses the
    /// configured threshold. Returns the applied mode on change.
    pub fn apply_weight_demotion(&mut self) -> Option<DetailMode> {
        if self.cfg.demote_threshold <= 0 {
            return None;
        }
        let pressure = self.weight_pressure();
        if pressure < self.cfg.demote_threshold {
            return None;
        }
        let next = match self.metrics.detail_mode() {
            DetailMode::Full => DetailMode::Band,
            DetailMode::Band | DetailMode::Agg => DetailMode::Agg,
        };
        if next != self.metrics.detail_mode() {
            self.metrics.set_detail_mode(next, self.cycle);
            return Some(next);
        }
        None
    }

    // ------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------
    pub fn drain_alerts(&mut self) -> Vec<AdaptiveAlert> {
        std::mem::take(&mut self.pending)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<AdaptiveAlert> {
        if limit == 0 {
            return Vec::new();
        }
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::alerts::AlertConfig;
    use crate::adaptive::severity::{SeverityEngine, SeverityRules};
    use crate::events::{EventBus, EventBusConfig};
    use crate::metrics::gating::GroupGating;

    fn harness(cfg: FollowupConfig) -> (FollowupEngine, Arc<EventBus>) {
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        let bus = Arc::new(EventBus::new(
            EventBusConfig {
                max_events: 128,
                backlog_warn: 76,
                backlog_degrade: 102,
                snapshot_gap_max: 500,
                force_full_retry_seconds: 30.0,
                trace_enabled: false,
                latency_capture: false,
            },
            metrics.clone(),
        ));
        let guard_cfg = AlertConfig {
            interp_threshold: 0.5,
            interp_streak: 1,
            bucket_util_min: 0.7,
            bucket_util_streak: 1,
            drift_window: 2,
            drift_pct_threshold: 20.0,
            row_tolerance: 0.5,
            ..Default::default()
        };
        let mut guards = AlertEngine::new(guard_cfg, SeverityEngine::new(true, SeverityRules::default()));
        guards.set_metrics(metrics.clone());
        let mut engine = FollowupEngine::new(cfg, guards, metrics);
        engine.set_bus(bus.clone());
        (engine, bus)
    }

    #[test]
    fn alert_publishes_followup_event_with_coalesce_key() {
        let (mut engine, bus) = harness(FollowupConfig {
            suppress_seconds: 0.0,
            ..Default::default()
        });
        engine.record_surface("NIFTY", Some(0.9), None);
        let events = bus.get_since(0, None);
        let followups: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == "followup_alert")
            .collect();
        assert_eq!(followups.len(), 1);
        assert_eq!(
            followups[0].coalesce_key.as_deref(),
            Some("followup:NIFTY:interpolation_high")
        );
        assert_eq!(followups[0].payload["severity"], "critical");
    }

    #[test]
    fn same_severity_within_window_is_suppressed() {
        let (mut engine, _bus) = harness(FollowupConfig {
            suppress_seconds: 3600.0,
            ..Default::default()
        });
        engine.record_surface("NIFTY", Some(0.55), None);
        engine.record_surface("NIFTY", Some(0.56), None);
        assert_eq!(engine.drain_alerts().len(), 1);
    }

    #[test]
    fn strictly_higher_severity_bypasses_suppression() {
        let (mut engine, _bus) = harness(FollowupConfig {
            suppress_seconds: 3600.0,
            ..Default::default()
        });
        // 0.55 is info under the default rules (warn at 0.6).
        engine.record_surface("NIFTY", Some(0.55), None);
        // 0.9 classifies critical: must bypass the window.
        engine.record_surface("NIFTY", Some(0.9), None);
        let drained = engine.drain_alerts();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].severity, Severity::Critical);
    }

    #[test]
    fn weight_pressure_accumulates_configured_weights() {
        let mut weights = HashMap::new();
        weights.insert(
            "interpolation_high".to_string(),
            HashMap::from([("critical".to_string(), 5i64), ("info".to_string(), 1i64)]),
        );
        let (mut engine, _bus) = harness(FollowupConfig {
            suppress_seconds: 0.0,
            weights,
            ..Default::default()
        });
        engine.record_surface("NIFTY", Some(0.9), None);
        engine.record_surface("NIFTY", Some(0.91), None);
        assert_eq!(engine.weight_pressure(), 10);
    }

    #[test]
    fn weight_demotion_steps_detail_mode() {
        let mut weights = HashMap::new();
        weights.insert(
            "interpolation_high".to_string(),
            HashMap::from([("critical".to_string(), 10i64)]),
        );
        let (mut engine, _bus) = harness(FollowupConfig {
            suppress_seconds: 0.0,
            demote_threshold: 10,
            weights,
            ..Default::default()
        });
        engine.record_surface("NIFTY", Some(0.9), None);
        assert_eq!(engine.apply_weight_demotion(), Some(DetailMode::Band));
        assert_eq!(engine.apply_weight_demotion(), Some(DetailMode::Agg));
        // Already at the floor tier: no further change reported.
        assert_eq!(engine.apply_weight_demotion(), None);
    }

    #[test]
    fn recent_buffer_is_bounded() {
        let (mut engine, _bus) = harness(FollowupConfig {
            suppress_seconds: 0.0,
            recent_buffer_max: 3,
            ..Default::default()
        });
        for i in 0..6 {
            engine.record_surface("NIFTY", Some(0.8 + (i as f64) * 0.001), None);
        }
        assert_eq!(engine.recent_alerts(10).len(), 3);
        assert_eq!(engine.recent_alerts(2).len(), 2);
    }

    #[test]
    fn disabled_engine_emits_nothing() {
        let (mut engine, bus) = harness(FollowupConfig {
            enabled: false,
            ..Default::default()
        });
        engine.record_surface("NIFTY", Some(0.95), None);
        engine.record_risk("NIFTY", 1000.0, 10);
        assert!(engine.drain_alerts().is_empty());
        assert!(bus.get_since(0, None).is_empty());
    }
}
