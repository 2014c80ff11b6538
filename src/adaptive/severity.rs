//! Severity classification and active-severity state.
//!
//! Per-type warn/critical thresholds come from `G6_ADAPTIVE_ALERT_SEVERITY_RULES`
//! (JSON). The guard's primary numeric is classified against them; for
//! interpolation and drift a larger value is worse, for bucket utilization a
//! smaller one is. Active severity per (index, type) is tracked and state
//! changes are published on the bus.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::{AdaptiveAlert, ALERT_BUCKET_UTIL_LOW, ALERT_INTERPOLATION_HIGH, ALERT_RISK_DELTA_DRIFT};
use crate::config::{env_bool, env_opt};
use crate::events::EventBus;
use crate::metrics::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TypeRule {
    pub warn: f64,
    pub critical: f64,
}

/// Threshold table keyed by alert type.
#[derive(Debug, Clone)]
pub struct SeverityRules {
    rules: HashMap<String, TypeRule>,
}

impl Default for SeverityRules {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            ALERT_INTERPOLATION_HIGH.to_string(),
            TypeRule { warn: 0.6, critical: 0.85 },
        );
        rules.insert(
            ALERT_RISK_DELTA_DRIFT.to_string(),
            TypeRule { warn: 25.0, critical: 50.0 },
        );
        // Utilization: lower is worse.
        rules.insert(
            ALERT_BUCKET_UTIL_LOW.to_string(),
            TypeRule { warn: 0.5, critical: 0.3 },
        );
        Self { rules }
    }
}

impl SeverityRules {
    pub fn from_env() -> Self {
        let mut base = Self::default();
        if let Some(raw) = env_opt("G6_ADAPTIVE_ALERT_SEVERITY_RULES") {
            match serde_json::from_str::<HashMap<String, TypeRule>>(&raw) {
                Ok(overrides) => {
                    for (k, v) in overrides {
                        base.rules.insert(k, v);
                    }
                }
                Err(e) => warn!(error = %e, "bad severity rules JSON; using defaults"),
            }
        }
        base
    }

    pub fn classify(&self, alert_type: &str, value: f64) -> Severity {
        let Some(rule) = self.rules.get(alert_type) else {
            return Severity::Info;
        };
        if alert_type == ALERT_BUCKET_UTIL_LOW {
            // Inverted scale: utilization below critical is worst.
            if value <= rule.critical {
                Severity::Critical
            } else if value <= rule.warn {
                Severity::Warn
            } else {
                Severity::Info
            }
        } else if value >= rule.critical {
            Severity::Critical
        } else if value >= rule.warn {
            Severity::Warn
        } else {
            Severity::Info
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ActiveState {
    current: Option<Severity>,
}

/// Tracks per-(index, type) active severity and publishes state changes.
pub struct SeverityEngine {
    enabled: bool,
    rules: SeverityRules,
    active: HashMap<(String, String), ActiveState>,
    bus: Option<Arc<EventBus>>,
}

impl SeverityEngine {
    pub fn new(enabled: bool, rules: SeverityRules) -> Self {
        Self {
            enabled,
            rules,
            active: HashMap::new(),
            bus: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env_bool("G6_ADAPTIVE_ALERT_SEVERITY", true),
            SeverityRules::from_env(),
        )
    }

    pub fn set_bus(&mut self, bus: Arc<EventBus>) {
        self.bus = Some(bus);
    }

    /// Set `severity` (and `active_severity` when state tracking is on)
    /// from the alert's primary numeric.
    pub fn enrich(&mut self, alert: &mut AdaptiveAlert) {
        let Some(value) = alert.primary_value() else {
            return;
        };
        let severity = self.rules.classify(&alert.alert_type, value);
        alert.severity = severity;
        if !self.enabled {
            return;
        }
        let key = (alert.index.clone(), alert.alert_type.clone());
        let state = self.active.entry(key.clone()).or_default();
        let changed = state.current != Some(severity);
        state.current = Some(severity);
        alert.active_severity = Some(severity);
        if changed {
            self.publish_state_change(&key.0, &key.1, severity);
        }
    }

    fn publish_state_change(&self, index: &str, alert_type: &str, severity: Severity) {
        let Some(bus) = &self.bus else { return };
        let counts = self.active_severity_counts();
        let coalesce = format!("severity:{index}:{alert_type}");
        let _ = bus.publish(
            "severity_state",
            json!({
                "index": index,
                "type": alert_type,
                "severity": severity.as_str(),
                "ts": unix_now(),
            }),
            Some(coalesce.as_str()),
            None,
        );
        let _ = bus.publish(
            "severity_counts",
            json!({"counts": counts, "ts": unix_now()}),
            Some("severity_counts"),
            None,
        );
    }

    /// Aggregate counts of active severities across all (index, type) keys.
    pub fn active_severity_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> =
            [("info", 0), ("warn", 0), ("critical", 0)].into();
        for state in self.active.values() {
            if let Some(sev) = state.current {
                *counts.entry(sev.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }
}
