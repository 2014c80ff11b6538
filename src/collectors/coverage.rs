//! Strike and field coverage diagnostics.

use tracing::{debug, warn};

use crate::config::env_bool;
use crate::metrics::MetricsRegistry;
use crate::models::{Instrument, OptionQuote};
use crate::strikes::StrikeIndex;

/// Fraction of the *requested* strike set realized by instruments, in [0,1].
/// Zero when the request was empty.
pub fn strike_coverage(
    metrics: &MetricsRegistry,
    requested: &StrikeIndex,
    instruments: &[Instrument],
    index: &str,
    rule: &str,
    expiry: &str,
) -> f64 {
    let realized = instruments.iter().map(|i| i.strike).filter(|s| *s > 0.0);
    let ratio = requested.realized_coverage(realized);
    if ratio < 0.8 && !env_bool("G6_SUPPRESS_COVERAGE_WARNINGS", false) {
        warn!(
            index,
            rule,
            expiry,
            coverage_pct = ratio * 100.0,
            requested = requested.len(),
            "instrument coverage low"
        );
    } else {
        debug!(index, rule, expiry, coverage_pct = ratio * 100.0, "instrument coverage");
    }
    metrics.set("instrument_coverage_pct", &[index, expiry], ratio * 100.0);
    ratio
}

/// Fraction of option rows carrying volume, oi and avg_price, in [0,1].
pub fn field_coverage(
    metrics: &MetricsRegistry,
    quotes: &[OptionQuote],
    index: &str,
    rule: &str,
    expiry: &str,
) -> f64 {
    if quotes.is_empty() {
        return 0.0;
    }
    let mut missing_volume = 0usize;
    let mut missing_oi = 0usize;
    let mut missing_avg = 0usize;
    let mut full = 0usize;
    for q in quotes {
        if q.volume == 0 {
            missing_volume += 1;
        }
        if q.oi == 0 {
            missing_oi += 1;
        }
        if !q.avg_price.map(|p| p > 0.0).unwrap_or(false) {
            missing_avg += 1;
        }
        if q.has_full_fields() {
            full += 1;
        }
    }
    for (field, count) in [
        ("volume", missing_volume),
        ("oi", missing_oi),
        ("avg_price", missing_avg),
    ] {
        if count > 0 {
            metrics.add("missing_option_fields", &[index, expiry, field], count as f64);
        }
    }
    let ratio = full as f64 / quotes.len() as f64;
    metrics.set("field_coverage_pct", &[index, expiry], ratio * 100.0);
    if ratio < 0.6 && !env_bool("G6_SUPPRESS_COVERAGE_WARNINGS", false) {
        warn!(
            index,
            rule,
            expiry,
            full,
            total = quotes.len(),
            "low option field coverage"
        );
    }
    ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;
    use crate::models::OptionSide;
    use chrono::NaiveDate;

    fn metrics() -> MetricsRegistry {
        MetricsRegistry::new(GroupGating::allow_all())
    }

    fn inst(strike: f64) -> Instrument {
        Instrument {
            tradingsymbol: format!("NIFTY25SEP{}CE", strike as u64),
            exchange: "NFO".into(),
            instrument_type: "CE".into(),
            strike,
            expiry: NaiveDate::from_ymd_opt(2025, 9, 25).unwrap(),
            underlying_name: None,
        }
    }

    fn quote(full: bool) -> OptionQuote {
        OptionQuote {
            symbol: "NIFTY25SEP20000CE".into(),
            exchange: "NFO".into(),
            last_price: 10.0,
            volume: if full { 100 } else { 0 },
            oi: if full { 100 } else { 0 },
            avg_price: if full { Some(10.0) } else { None },
            timestamp: None,
            strike: 20000.0,
            side: OptionSide::CE,
            iv: None,
            greeks: None,
        }
    }

    #[test]
    fn strike_coverage_is_over_requested_set() {
        let m = metrics();
        let requested = StrikeIndex::build(&[19950.0, 20000.0, 20050.0, 20100.0]);
        let instruments = vec![inst(20000.0), inst(20050.0)];
        let ratio = strike_coverage(&m, &requested, &instruments, "NIFTY", "this_week", "2025-09-25");
        assert!((ratio - 0.5).abs() < 1e-9);
        assert_eq!(
            m.gauge_value("instrument_coverage_pct", &["NIFTY", "2025-09-25"]),
            Some(50.0)
        );
    }

    #[test]
    fn empty_request_has_zero_coverage() {
        let m = metrics();
        let requested = StrikeIndex::build(&[]);
        assert_eq!(
            strike_coverage(&m, &requested, &[inst(20000.0)], "NIFTY", "r", "e"),
            0.0
        );
    }

    #[test]
    fn field_coverage_counts_full_rows() {
        let m = metrics();
        let quotes = vec![quote(true), quote(true), quote(false), quote(false)];
        let ratio = field_coverage(&m, &quotes, "NIFTY", "this_week", "2025-09-25");
        assert!((ratio - 0.5).abs() < 1e-9);
        assert_eq!(
            m.counter_value("missing_option_fields", &["NIFTY", "2025-09-25", "volume"]),
            Some(2.0)
        );
    }

    #[test]
    fn field_coverage_of_empty_quote_set_is_zero() {
        let m = metrics();
        assert_eq!(field_coverage(&m, &[], "NIFTY", "r", "e"), 0.0);
    }
}
