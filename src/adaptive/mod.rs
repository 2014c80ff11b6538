//! Adaptive feedback: analytics-driven alert guards, severity enrichment and
//! the follow-up dispatcher with suppression, escalation and weight pressure.

pub mod alerts;
pub mod followups;
pub mod severity;

use serde::Serialize;

pub use self::alerts::{AlertConfig, AlertEngine};
pub use self::followups::{FollowupConfig, FollowupEngine};
pub use self::severity::{Severity, SeverityEngine, SeverityRules};

/// An alert emitted by one of the adaptive guards.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub index: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_severity: Option<Severity>,
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpolated_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
}

pub const ALERT_INTERPOLATION_HIGH: &str = "interpolation_high";
pub const ALERT_RISK_DELTA_DRIFT: &str = "risk_delta_drift";
pub const ALERT_BUCKET_UTIL_LOW: &str = "bucket_util_low";

impl AdaptiveAlert {
    pub(crate) fn base(alert_type: &str, index: &str, message: String) -> Self {
        Self {
            alert_type: alert_type.to_string(),
            index: index.to_string(),
            message,
            severity: Severity::Info,
            active_severity: None,
            ts: 0.0,
            cycle: None,
            weight: None,
            interpolated_fraction: None,
            drift_pct: None,
            sign: None,
            utilization: None,
        }
    }

    /// The guard-specific numeric the severity rules classify on.
    pub fn primary_value(&self) -> Option<f64> {
        self.interpolated_fraction
            .or(self.drift_pct.map(f64::abs))
            .or(self.utilization)
    }
}
