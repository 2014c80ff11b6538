//! Core domain models shared across the collection pipeline, analytics
//! builders and artifact writers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical expiry selection rule configured per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryRule {
    ThisWeek,
    NextWeek,
    ThisMonth,
    NextMonth,
}

impl ExpiryRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryRule::ThisWeek => "this_week",
            ExpiryRule::NextWeek => "next_week",
            ExpiryRule::ThisMonth => "this_month",
            ExpiryRule::NextMonth => "next_month",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "this_week" => Some(ExpiryRule::ThisWeek),
            "next_week" => Some(ExpiryRule::NextWeek),
            "this_month" => Some(ExpiryRule::ThisMonth),
            "next_month" => Some(ExpiryRule::NextMonth),
            _ => None,
        }
    }
}

impl fmt::Display for ExpiryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-index collection parameters. Mutated only at config load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub expiries: Vec<ExpiryRule>,
    pub strikes_itm: u32,
    pub strikes_otm: u32,
}

fn default_true() -> bool {
    true
}

impl IndexParams {
    pub fn new(name: &str, expiries: Vec<ExpiryRule>, strikes_itm: u32, strikes_otm: u32) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            expiries,
            strikes_itm,
            strikes_otm,
        }
    }
}

/// Call/put side of an option contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionSide {
    CE,
    PE,
}

impl OptionSide {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CE" => Some(OptionSide::CE),
            "PE" => Some(OptionSide::PE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionSide::CE => "CE",
            OptionSide::PE => "PE",
        }
    }
}

impl fmt::Display for OptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw instrument row as returned by the provider. `instrument_type` is kept
/// verbatim because the filter must classify non-option rows (FUT etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub tradingsymbol: String,
    pub exchange: String,
    pub instrument_type: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    /// Underlying/instrument name field when the exchange publishes one.
    #[serde(default)]
    pub underlying_name: Option<String>,
}

/// Option greeks block attached to a quote by the analytics pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Enriched per-option quote. Produced by quote enrichment, then mutated by
/// the IV and greeks passes before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub volume: u64,
    pub oi: u64,
    #[serde(default)]
    pub avg_price: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub strike: f64,
    pub side: OptionSide,
    #[serde(default)]
    pub iv: Option<f64>,
    #[serde(default)]
    pub greeks: Option<Greeks>,
}

impl OptionQuote {
    /// Zero-price placeholder used when quote enrichment returns nothing;
    /// keeps downstream status PARTIAL instead of crashing the expiry.
    pub fn synthetic(inst: &Instrument, side: OptionSide) -> Self {
        Self {
            symbol: inst.tradingsymbol.clone(),
            exchange: inst.exchange.clone(),
            last_price: 0.0,
            volume: 0,
            oi: 0,
            avg_price: None,
            timestamp: None,
            strike: inst.strike,
            side,
            iv: None,
            greeks: None,
        }
    }

    pub fn has_full_fields(&self) -> bool {
        self.volume > 0 && self.oi > 0 && self.avg_price.map(|p| p > 0.0).unwrap_or(false)
    }
}

/// Immutable snapshot of one (index, expiry) leg for a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirySnapshot {
    pub index: String,
    pub expiry_rule: ExpiryRule,
    pub expiry_date: NaiveDate,
    pub atm_strike: f64,
    pub options: Vec<OptionQuote>,
    pub generated_at: DateTime<Utc>,
}

impl ExpirySnapshot {
    pub fn option_count(&self) -> usize {
        self.options.len()
    }
}

/// Per-expiry classification token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpiryStatus {
    Ok,
    Partial,
    Empty,
    Stale,
}

impl ExpiryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryStatus::Ok => "OK",
            ExpiryStatus::Partial => "PARTIAL",
            ExpiryStatus::Empty => "EMPTY",
            ExpiryStatus::Stale => "STALE",
        }
    }
}

/// Machine-friendly reason attached to PARTIAL expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    LowStrike,
    LowField,
    LowBoth,
    Unknown,
}

impl PartialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialReason::LowStrike => "low_strike",
            PartialReason::LowField => "low_field",
            PartialReason::LowBoth => "low_both",
            PartialReason::Unknown => "unknown",
        }
    }
}

/// Status record for one processed expiry within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryRecord {
    pub rule: ExpiryRule,
    pub expiry_date: Option<NaiveDate>,
    pub status: ExpiryStatus,
    pub options: usize,
    /// Fraction of *requested* strikes realized, in [0,1].
    pub strike_coverage: f64,
    /// Fraction of option rows carrying volume+oi+avg_price, in [0,1].
    pub field_coverage: f64,
    pub partial_reason: Option<PartialReason>,
    /// True when the expiry failed hard (provider error / no resolution).
    #[serde(default)]
    pub failed: bool,
}

/// Aggregated per-index outcome for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleStatus {
    pub index: String,
    pub attempts: u32,
    pub failures: u32,
    pub option_count: usize,
    pub status: ExpiryStatus,
    pub expiries: Vec<ExpiryRecord>,
    pub stale: bool,
}

/// Flat option row consumed by the analytics builders. `expiry` is the
/// ISO date string so surface/risk rows group on a stable key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSnapshotRow {
    pub index: String,
    pub expiry: String,
    pub strike: f64,
    pub underlying: f64,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub vega: Option<f64>,
    pub theta: Option<f64>,
    pub rho: Option<f64>,
}

impl OptionSnapshotRow {
    pub fn from_quote(index: &str, expiry: NaiveDate, underlying: f64, q: &OptionQuote) -> Self {
        Self {
            index: index.to_string(),
            expiry: expiry.to_string(),
            strike: q.strike,
            underlying,
            iv: q.iv,
            delta: q.greeks.map(|g| g.delta),
            gamma: q.greeks.map(|g| g.gamma),
            vega: q.greeks.map(|g| g.vega),
            theta: q.greeks.map(|g| g.theta),
            rho: q.greeks.map(|g| g.rho),
        }
    }
}

/// Summary payload handed back by the persistence sink after writing an
/// expiry's option rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkMetricsPayload {
    pub pcr: Option<f64>,
    pub day_width: u32,
    pub timestamp: DateTime<Utc>,
    pub expiry_code: String,
}

/// Cross-index overview derived from the cycle's expiry snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewSnapshot {
    pub generated_at: DateTime<Utc>,
    pub total_indices: usize,
    pub total_expiries: usize,
    pub total_options: usize,
    pub put_call_ratio: Option<f64>,
    pub max_pain_strike: Option<f64>,
}

impl OverviewSnapshot {
    pub fn from_expiry_snapshots(snaps: &[ExpirySnapshot]) -> Self {
        let total_indices = snaps
            .iter()
            .map(|s| s.index.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let total_expiries = snaps.len();
        let total_options = snaps.iter().map(|s| s.option_count()).sum();
        let mut calls = 0usize;
        let mut puts = 0usize;
        for s in snaps {
            for o in &s.options {
                match o.side {
                    OptionSide::CE => calls += 1,
                    OptionSide::PE => puts += 1,
                }
            }
        }
        let pcr = if calls > 0 {
            Some(puts as f64 / calls as f64)
        } else {
            None
        };
        let strikes: Vec<f64> = snaps
            .iter()
            .filter(|s| s.atm_strike > 0.0)
            .map(|s| s.atm_strike)
            .collect();
        let max_pain = if strikes.is_empty() {
            None
        } else {
            Some(strikes.iter().sum::<f64>() / strikes.len() as f64)
        };
        Self {
            generated_at: Utc::now(),
            total_indices,
            total_expiries,
            total_options,
            put_call_ratio: pcr,
            max_pain_strike: max_pain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn quote(side: OptionSide, strike: f64) -> OptionQuote {
        OptionQuote {
            symbol: format!("NIFTY25SEP{}{}", strike as u64, side),
            exchange: "NFO".into(),
            last_price: 12.5,
            volume: 100,
            oi: 2000,
            avg_price: Some(12.1),
            timestamp: None,
            strike,
            side,
            iv: None,
            greeks: None,
        }
    }

    #[test]
    fn overview_counts_and_pcr() {
        let snap = ExpirySnapshot {
            index: "NIFTY".into(),
            expiry_rule: ExpiryRule::ThisWeek,
            expiry_date: NaiveDate::from_ymd_opt(2025, 5, 15).unwrap(),
            atm_strike: 20000.0,
            options: vec![
                quote(OptionSide::CE, 20000.0),
                quote(OptionSide::PE, 20000.0),
                quote(OptionSide::PE, 20050.0),
            ],
            generated_at: Utc::now(),
        };
        let ov = OverviewSnapshot::from_expiry_snapshots(&[snap]);
        assert_eq!(ov.total_indices, 1);
        assert_eq!(ov.total_expiries, 1);
        assert_eq!(ov.total_options, 3);
        assert_eq!(ov.put_call_ratio, Some(2.0));
        assert_eq!(ov.max_pain_strike, Some(20000.0));
    }

    #[test]
    fn full_field_detection_requires_all_three() {
        let mut q = quote(OptionSide::CE, 20000.0);
        assert!(q.has_full_fields());
        q.avg_price = None;
        assert!(!q.has_full_fields());
        q.avg_price = Some(10.0);
        q.volume = 0;
        assert!(!q.has_full_fields());
    }

    #[test]
    fn expiry_rule_round_trips_through_str() {
        for rule in [
            ExpiryRule::ThisWeek,
            ExpiryRule::NextWeek,
            ExpiryRule::ThisMonth,
            ExpiryRule::NextMonth,
        ] {
            assert_eq!(ExpiryRule::parse(rule.as_str()), Some(rule));
        }
        assert_eq!(ExpiryRule::parse("fortnight"), None);
    }
}
