//! Per-expiry and cycle-level status classification.
//!
//! OK      : options > 0 and strike & field coverage at/above thresholds.
//! PARTIAL : options > 0 with coverage below a threshold.
//! EMPTY   : options == 0.
//! STALE is applied by the stale-cycle override, not here.

use crate::config::env_f64;
use crate::models::{ExpiryRecord, ExpiryStatus, PartialReason};

pub const STRIKE_COVERAGE_OK: f64 = 0.75;
pub const FIELD_COVERAGE_OK: f64 = 0.55;

#[derive(Debug, Clone, Copy)]
pub struct StatusThresholds {
    pub strike: f64,
    pub field: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            strike: STRIKE_COVERAGE_OK,
            field: FIELD_COVERAGE_OK,
        }
    }
}

impl StatusThresholds {
    pub fn from_env() -> Self {
        let clamp = |v: f64, default: f64| if (0.0..=1.0).contains(&v) { v } else { default };
        Self {
            strike: clamp(
                env_f64("G6_STRIKE_COVERAGE_OK", STRIKE_COVERAGE_OK),
                STRIKE_COVERAGE_OK,
            ),
            field: clamp(
                env_f64("G6_FIELD_COVERAGE_OK", FIELD_COVERAGE_OK),
                FIELD_COVERAGE_OK,
            ),
        }
    }
}

pub fn compute_expiry_status(
    options: usize,
    strike_coverage: f64,
    field_coverage: f64,
    thresholds: StatusThresholds,
) -> ExpiryStatus {
    if options == 0 {
        return ExpiryStatus::Empty;
    }
    if strike_coverage >= thresholds.strike && field_coverage >= thresholds.field {
        ExpiryStatus::Ok
    } else {
        ExpiryStatus::Partial
    }
}

pub fn derive_partial_reason(
    status: ExpiryStatus,
    strike_coverage: f64,
    field_coverage: f64,
    thresholds: StatusThresholds,
) -> Option<PartialReason> {
    if status != ExpiryStatus::Partial {
        return None;
    }
    if strike_coverage < 0.0 || field_coverage < 0.0 {
        return Some(PartialReason::Unknown);
    }
    let strike_bad = strike_coverage < thresholds.strike;
    let field_bad = field_coverage < thresholds.field;
    Some(match (strike_bad, field_bad) {
        (true, true) => PartialReason::LowBoth,
        (true, false) => PartialReason::LowStrike,
        (false, true) => PartialReason::LowField,
        (false, false) => PartialReason::Unknown,
    })
}

/// EMPTY when every expiry is EMPTY, OK when every expiry is OK, PARTIAL
/// otherwise. The STALE override is applied by the caller.
pub fn aggregate_cycle_status(records: &[ExpiryRecord]) -> ExpiryStatus {
    if records.is_empty() {
        return ExpiryStatus::Empty;
    }
    if records.iter().all(|r| r.status == ExpiryStatus::Empty) {
        return ExpiryStatus::Empty;
    }
    if records.iter().all(|r| r.status == ExpiryStatus::Ok) {
        return ExpiryStatus::Ok;
    }
    ExpiryStatus::Partial
}
