//! Option instrument acceptance.
//!
//! Reusable predicate deciding whether a raw instrument row belongs to the
//! (index, expiry, strike set) under collection. Rejection order is part of
//! the contract: callers key counters off the returned reason.

pub mod root_cache;
pub mod symbol_root;

use chrono::NaiveDate;
use std::collections::HashSet;

use crate::config::env_bool;
use crate::models::Instrument;
use crate::strikes::strike_key;
use self::root_cache::cached_detect_root;
use self::symbol_root::{parse_root_before_digits, symbol_matches_index, MatchMode};

/// Canonical rejection reasons, stable across releases (dashboards group on
/// them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    NotOptionType,
    RootMismatch,
    ExpiryMismatch,
    StrikeMismatch,
    UnderlyingMismatch,
    Accepted,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotOptionType => "not_option_type",
            RejectReason::RootMismatch => "root_mismatch",
            RejectReason::ExpiryMismatch => "expiry_mismatch",
            RejectReason::StrikeMismatch => "strike_mismatch",
            RejectReason::UnderlyingMismatch => "underlying_mismatch",
            RejectReason::Accepted => "accepted",
        }
    }
}

/// Per-(index, expiry) filter context assembled once per expiry pass.
#[derive(Debug, Clone)]
pub struct OptionFilterContext {
    pub index_symbol: String,
    pub expiry_target: NaiveDate,
    /// Scaled 2-decimal strike keys (see [`crate::strikes::strike_key`]).
    pub strike_key_set: HashSet<i64>,
    pub match_mode: MatchMode,
    pub underlying_strict: bool,
    pub safe_mode: bool,
}

impl OptionFilterContext {
    pub fn new(index_symbol: &str, expiry_target: NaiveDate, strikes: &[f64]) -> Self {
        Self {
            index_symbol: index_symbol.to_ascii_uppercase(),
            expiry_target,
            strike_key_set: strikes.iter().map(|s| strike_key(*s)).collect(),
            match_mode: MatchMode::from_env(),
            underlying_strict: env_bool("G6_SYMBOL_MATCH_UNDERLYING_STRICT", true),
            safe_mode: env_bool("G6_SYMBOL_MATCH_SAFEMODE", true),
        }
    }

    pub fn with_expiry(mut self, expiry: NaiveDate) -> Self {
        self.expiry_target = expiry;
        self
    }
}

const CONTAMINATION_SAMPLE_CAP: usize = 6;

fn push_sample(list: &mut Vec<String>, symbol: &str) {
    if list.len() < CONTAMINATION_SAMPLE_CAP {
        list.push(symbol.to_string());
    }
}

/// Decide acceptance for one instrument. First failing check wins; the
/// ordering below is load-bearing (root contamination must be detected
/// before expiry/strike mismatches so the samples stay meaningful).
pub fn accept_option(
    inst: &Instrument,
    ctx: &OptionFilterContext,
    expected_expiry: Option<NaiveDate>,
    mut contamination_samples: Option<&mut Vec<String>>,
) -> (bool, RejectReason) {
    let itype = inst.instrument_type.to_ascii_uppercase();
    if itype != "CE" && itype != "PE" {
        return (false, RejectReason::NotOptionType);
    }

    // Early root gate via the shared cache.
    if let Some(root) = cached_detect_root(&inst.tradingsymbol) {
        if root != ctx.index_symbol {
            if let Some(list) = contamination_samples.as_mut() {
                push_sample(list, &inst.tradingsymbol);
            }
            return (false, RejectReason::RootMismatch);
        }
    }

    let target = expected_expiry.unwrap_or(ctx.expiry_target);
    if inst.expiry != target {
        return (false, RejectReason::ExpiryMismatch);
    }

    if !ctx.strike_key_set.contains(&strike_key(inst.strike)) {
        return (false, RejectReason::StrikeMismatch);
    }

    if !symbol_matches_index(&ctx.index_symbol, &inst.tradingsymbol, ctx.match_mode) {
        return (false, RejectReason::RootMismatch);
    }

    if ctx.safe_mode {
        if let Some(parsed) = parse_root_before_digits(&inst.tradingsymbol) {
            if parsed != ctx.index_symbol {
                if let Some(list) = contamination_samples.as_mut() {
                    push_sample(list, &inst.tradingsymbol);
                }
                return (false, RejectReason::RootMismatch);
            }
        }
    }

    if ctx.underlying_strict {
        if let Some(name) = inst.underlying_name.as_deref() {
            let base = name.to_ascii_uppercase();
            if !base.is_empty() && base != ctx.index_symbol {
                if let Some(list) = contamination_samples.as_mut() {
                    push_sample(list, &inst.tradingsymbol);
                }
                return (false, RejectReason::UnderlyingMismatch);
            }
        }
    }

    (true, RejectReason::Accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 25).unwrap()
    }

    fn inst(symbol: &str, itype: &str, strike: f64) -> Instrument {
        Instrument {
            tradingsymbol: symbol.to_string(),
            exchange: "NFO".into(),
            instrument_type: itype.to_string(),
            strike,
            expiry: expiry(),
            underlying_name: Some("NIFTY".into()),
        }
    }

    fn ctx() -> OptionFilterContext {
        OptionFilterContext {
            index_symbol: "NIFTY".into(),
            expiry_target: expiry(),
            strike_key_set: [25000.0, 25050.0].iter().map(|s| strike_key(*s)).collect(),
            match_mode: MatchMode::Strict,
            underlying_strict: true,
            safe_mode: true,
        }
    }

    #[test]
    fn accepts_clean_option() {
        let (ok, reason) = accept_option(&inst("NIFTY25SEP25000CE", "CE", 25000.0), &ctx(), None, None);
        assert!(ok);
        assert_eq!(reason, RejectReason::Accepted);
    }

    #[test]
    fn rejects_non_option_first() {
        // A futures row from a foreign root must fail on instrument type,
        // not root, because the type check runs first.
        let (ok, reason) = accept_option(&inst("BANKNIFTY25SEPFUT", "FUT", 0.0), &ctx(), None, None);
        assert!(!ok);
        assert_eq!(reason, RejectReason::NotOptionType);
    }

    #[test]
    fn rejects_root_mismatch_and_samples() {
        let mut samples = Vec::new();
        let (ok, reason) = accept_option(
            &inst("FINNIFTY25SEP25000CE", "CE", 25000.0),
            &ctx(),
            None,
            Some(&mut samples),
        );
        assert!(!ok);
        assert_eq!(reason, RejectReason::RootMismatch);
        assert_eq!(samples, vec!["FINNIFTY25SEP25000CE".to_string()]);
    }

    #[test]
    fn contamination_samples_capped_at_six() {
        let mut samples = Vec::new();
        for i in 0..10 {
            let sym = format!("FINNIFTY25SEP{}CE", 21000 + i * 50);
            let _ = accept_option(&inst(&sym, "CE", 25000.0), &ctx(), None, Some(&mut samples));
        }
        assert_eq!(samples.len(), 6);
    }

    #[test]
    fn rejects_expiry_then_strike() {
        let mut other = inst("NIFTY25OCT25000CE", "CE", 25000.0);
        other.expiry = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        let (_, reason) = accept_option(&other, &ctx(), None, None);
        assert_eq!(reason, RejectReason::ExpiryMismatch);

        let (_, reason) = accept_option(&inst("NIFTY25SEP26000CE", "CE", 26000.0), &ctx(), None, None);
        assert_eq!(reason, RejectReason::StrikeMismatch);
    }

    #[test]
    fn expected_expiry_override_wins() {
        let fallback = NaiveDate::from_ymd_opt(2025, 10, 2).unwrap();
        let mut i = inst("NIFTY25OCT25000CE", "CE", 25000.0);
        i.expiry = fallback;
        let (ok, _) = accept_option(&i, &ctx(), Some(fallback), None);
        assert!(ok);
    }

    #[test]
    fn underlying_strict_rejects_foreign_name() {
        let mut i = inst("NIFTY25SEP25000CE", "CE", 25000.0);
        i.underlying_name = Some("NIFTYNXT50".into());
        let (ok, reason) = accept_option(&i, &ctx(), None, None);
        assert!(!ok);
        assert_eq!(reason, RejectReason::UnderlyingMismatch);
    }

    #[test]
    fn decision_is_deterministic() {
        let i = inst("NIFTY25SEP25050CE", "CE", 25050.0);
        let c = ctx();
        let first = accept_option(&i, &c, None, None);
        for _ in 0..5 {
            assert_eq!(accept_option(&i, &c, None, None), first);
        }
    }
}
