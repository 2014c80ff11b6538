//! Per-expiry collection workflow.
//!
//! Resolve -> fetch -> filter (with forward/backward/relaxed fallbacks) ->
//! enrich -> IV -> greeks -> persist -> coverage -> classify. Provider
//! errors are caught at this boundary and recorded; sibling expiries are
//! never affected.

use chrono::{Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use super::coverage::{field_coverage, strike_coverage};
use super::status_reducer::{compute_expiry_status, derive_partial_reason, StatusThresholds};
use crate::analytics::greeks::{time_to_expiry_years, OptionGreeks};
use crate::config::env_bool;
use crate::filters::{accept_option, OptionFilterContext, RejectReason};
use crate::metrics::MetricsRegistry;
use crate::models::{
    ExpiryRecord, ExpiryRule, ExpirySnapshot, ExpiryStatus, Greeks, Instrument, OptionQuote,
    OptionSide, OptionSnapshotRow, SinkMetricsPayload,
};
use crate::provider::{synthesize_zero_quotes, Provider, ProviderError};
use crate::storage::OptionsSink;
use crate::strikes::{StrikeIndex, StrikeUniverse};

#[derive(Debug, Clone, Copy)]
pub struct FallbackFlags {
    pub nearest: bool,
    pub backward: bool,
    pub relax: bool,
}

impl FallbackFlags {
    pub fn from_env() -> Self {
        Self {
            nearest: env_bool("G6_ENABLE_NEAREST_EXPIRY_FALLBACK", true),
            backward: env_bool("G6_ENABLE_BACKWARD_EXPIRY_FALLBACK", false),
            relax: env_bool("G6_RELAX_EMPTY_MATCH", true),
        }
    }
}

pub struct ExpiryContext<'a> {
    pub provider: &'a dyn Provider,
    pub sink: &'a dyn OptionsSink,
    pub metrics: &'a MetricsRegistry,
    pub thresholds: StatusThresholds,
    pub greeks_calc: &'a OptionGreeks,
    pub compute_greeks: bool,
    pub estimate_iv: bool,
    pub fallbacks: FallbackFlags,
}

pub struct ExpiryOutcome {
    pub record: ExpiryRecord,
    pub snapshot: Option<ExpirySnapshot>,
    pub rows: Vec<OptionSnapshotRow>,
    pub sink_payload: Option<SinkMetricsPayload>,
    pub contamination: Vec<String>,
}

fn failed_record(rule: ExpiryRule, expiry_date: Option<NaiveDate>) -> ExpiryRecord {
    ExpiryRecord {
        rule,
        expiry_date,
        status: ExpiryStatus::Empty,
        options: 0,
        strike_coverage: 0.0,
        field_coverage: 0.0,
        partial_reason: None,
        failed: true,
    }
}

fn failed_outcome(rule: ExpiryRule, expiry_date: Option<NaiveDate>) -> ExpiryOutcome {
    ExpiryOutcome {
        record: failed_record(rule, expiry_date),
        snapshot: None,
        rows: Vec::new(),
        sink_payload: None,
        contamination: Vec::new(),
    }
}

pub async fn process_expiry(
    ctx: &ExpiryContext<'_>,
    index: &str,
    rule: ExpiryRule,
    universe: &StrikeUniverse,
    atm_strike: f64,
    index_price: f64,
) -> ExpiryOutcome {
    let metrics = ctx.metrics;

    let expiry = match ctx.provider.resolve_expiry(index, rule).await {
        Ok(d) => d,
        Err(e) => {
            warn!(index, rule = %rule, error = %e, "expiry resolution failed");
            metrics.inc("index_errors", &[index, e.kind()]);
            return failed_outcome(rule, None);
        }
    };

    let raw_instruments = match ctx
        .provider
        .get_option_instruments(index, expiry, &universe.strikes)
        .await
    {
        Ok(list) => list,
        Err(e) => {
            warn!(index, rule = %rule, error = %e, "instrument fetch failed");
            metrics.inc("index_errors", &[index, e.kind()]);
            return failed_outcome(rule, Some(expiry));
        }
    };

    let filter_ctx = OptionFilterContext::new(index, expiry, &universe.strikes);
    let mut contamination: Vec<String> = Vec::new();
    let mut accepted = run_filter(
        metrics,
        index,
        &raw_instruments,
        &filter_ctx,
        None,
        &mut contamination,
    );

    let mut effective_expiry = expiry;
    if accepted.is_empty() {
        match apply_fallbacks(ctx, index, expiry, universe, &filter_ctx, &mut contamination).await {
            Ok(Some((fallback_expiry, fallback_accepted))) => {
                effective_expiry = fallback_expiry;
                accepted = fallback_accepted;
            }
            Ok(None) => {}
            Err(e) => {
                metrics.inc("index_errors", &[index, e.kind()]);
            }
        }
    }

    if accepted.is_empty() {
        // INSTRUMENT_EMPTY: nothing matched after every fallback.
        let record = ExpiryRecord {
            rule,
            expiry_date: Some(effective_expiry),
            status: ExpiryStatus::Empty,
            options: 0,
            strike_coverage: 0.0,
            field_coverage: 0.0,
            partial_reason: None,
            failed: false,
        };
        return ExpiryOutcome {
            record,
            snapshot: None,
            rows: Vec::new(),
            sink_payload: None,
            contamination,
        };
    }

    // Quote enrichment; empty responses degrade to synthetic zero quotes so
    // the expiry classifies PARTIAL instead of aborting.
    let quote_map = match ctx.provider.enrich_with_quotes(&accepted).await {
        Ok(map) if !map.is_empty() => map,
        Ok(_) => {
            metrics.inc("provider_synthetic_quotes", &[index]);
            synthesize_zero_quotes(&accepted)
        }
        Err(e) => {
            warn!(index, rule = %rule, error = %e, "quote enrichment failed");
            metrics.inc("index_errors", &[index, e.kind()]);
            metrics.inc("provider_synthetic_quotes", &[index]);
            synthesize_zero_quotes(&accepted)
        }
    };

    let mut quotes: Vec<OptionQuote> = accepted
        .iter()
        .filter_map(|inst| quote_map.get(&inst.tradingsymbol).cloned())
        .collect();
    quotes.sort_by(|a, b| {
        a.strike
            .partial_cmp(&b.strike)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.side.as_str().cmp(b.side.as_str()))
    });

    if ctx.estimate_iv {
        estimate_missing_iv(ctx, index, effective_expiry, index_price, &mut quotes);
    }
    if ctx.compute_greeks {
        compute_missing_greeks(ctx, index, effective_expiry, index_price, &mut quotes);
    }

    let sink_payload = match ctx.sink.write_options_data(
        index,
        rule,
        effective_expiry,
        atm_strike,
        &quotes,
        Utc::now(),
    ) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(index, rule = %rule, error = %e, "options persistence failed");
            metrics.inc("persist_errors", &["csv"]);
            None
        }
    };

    let requested = StrikeIndex::build(&universe.strikes);
    let expiry_str = effective_expiry.to_string();
    let strike_cov = strike_coverage(
        metrics,
        &requested,
        &accepted,
        index,
        rule.as_str(),
        &expiry_str,
    );
    let field_cov = field_coverage(metrics, &quotes, index, rule.as_str(), &expiry_str);
    let status = compute_expiry_status(quotes.len(), strike_cov, field_cov, ctx.thresholds);
    let partial_reason = derive_partial_reason(status, strike_cov, field_cov, ctx.thresholds);

    metrics.add("index_options_processed", &[index], quotes.len() as f64);

    let rows = quotes
        .iter()
        .map(|q| OptionSnapshotRow::from_quote(index, effective_expiry, index_price, q))
        .collect();
    let snapshot = ExpirySnapshot {
        index: index.to_string(),
        expiry_rule: rule,
        expiry_date: effective_expiry,
        atm_strike,
        options: quotes,
        generated_at: Utc::now(),
    };
    let record = ExpiryRecord {
        rule,
        expiry_date: Some(effective_expiry),
        status,
        options: snapshot.option_count(),
        strike_coverage: strike_cov,
        field_coverage: field_cov,
        partial_reason,
        failed: false,
    };
    ExpiryOutcome {
        record,
        snapshot: Some(snapshot),
        rows,
        sink_payload,
        contamination,
    }
}

fn run_filter(
    metrics: &MetricsRegistry,
    index: &str,
    instruments: &[Instrument],
    ctx: &OptionFilterContext,
    expected_expiry: Option<NaiveDate>,
    contamination: &mut Vec<String>,
) -> Vec<Instrument> {
    if env_bool("G6_DISABLE_PREFILTER", false) {
        return instruments.to_vec();
    }
    let mut accepted = Vec::with_capacity(instruments.len());
    for inst in instruments {
        let (ok, reason) = accept_option(inst, ctx, expected_expiry, Some(contamination));
        if ok {
            accepted.push(inst.clone());
        } else if reason != RejectReason::Accepted {
            metrics.inc("option_filter_rejects", &[index, reason.as_str()]);
        }
    }
    accepted
}

/// Empty-match remediation: forward-nearest expiries (up to 4), then up to
/// 3 days back, then permissive strike-based reselection.
async fn apply_fallbacks(
    ctx: &ExpiryContext<'_>,
    index: &str,
    expiry: NaiveDate,
    universe: &StrikeUniverse,
    filter_ctx: &OptionFilterContext,
    contamination: &mut Vec<String>,
) -> Result<Option<(NaiveDate, Vec<Instrument>)>, ProviderError> {
    let metrics = ctx.metrics;
    let candidates = ctx.provider.get_expiry_dates(index).await.unwrap_or_default();

    if ctx.fallbacks.nearest {
        let forward: Vec<NaiveDate> = candidates
            .iter()
            .copied()
            .filter(|d| *d > expiry)
            .take(4)
            .collect();
        for candidate in forward {
            let instruments = ctx
                .provider
                .get_option_instruments(index, candidate, &universe.strikes)
                .await?;
            let accepted = run_filter(
                metrics,
                index,
                &instruments,
                filter_ctx,
                Some(candidate),
                contamination,
            );
            if !accepted.is_empty() {
                debug!(index, from = %expiry, to = %candidate, "forward expiry fallback");
                metrics.inc("expiry_fallback", &[index, "forward"]);
                return Ok(Some((candidate, accepted)));
            }
        }
    }

    if ctx.fallbacks.backward {
        let floor = expiry - Duration::days(3);
        let mut backward: Vec<NaiveDate> = candidates
            .iter()
            .copied()
            .filter(|d| *d < expiry && *d >= floor)
            .collect();
        backward.sort_by(|a, b| b.cmp(a));
        for candidate in backward {
            let instruments = ctx
                .provider
                .get_option_instruments(index, candidate, &universe.strikes)
                .await?;
            let accepted = run_filter(
                metrics,
                index,
                &instruments,
                filter_ctx,
                Some(candidate),
                contamination,
            );
            if !accepted.is_empty() {
                debug!(index, from = %expiry, to = %candidate, "backward expiry fallback");
                metrics.inc("expiry_fallback", &[index, "backward"]);
                return Ok(Some((candidate, accepted)));
            }
        }
    }

    if ctx.fallbacks.relax {
        // Permissive reselection: keep option rows on any requested strike
        // and adopt the nearest expiry among them.
        let instruments = ctx
            .provider
            .get_option_instruments(index, expiry, &universe.strikes)
            .await?;
        let strike_set = StrikeIndex::build(&universe.strikes);
        let mut lenient: Vec<Instrument> = instruments
            .into_iter()
            .filter(|i| OptionSide::parse(&i.instrument_type).is_some())
            .filter(|i| strike_set.contains(i.strike))
            .collect();
        if let Some(nearest) = lenient.iter().map(|i| i.expiry).min() {
            lenient.retain(|i| i.expiry == nearest);
            if !lenient.is_empty() {
                debug!(index, adopted = %nearest, "relaxed empty-match reselection");
                metrics.inc("expiry_fallback", &[index, "relaxed"]);
                return Ok(Some((nearest, lenient)));
            }
        }
    }

    Ok(None)
}

fn estimate_missing_iv(
    ctx: &ExpiryContext<'_>,
    index: &str,
    expiry: NaiveDate,
    index_price: f64,
    quotes: &mut [OptionQuote],
) {
    if !(index_price > 0.0) {
        return;
    }
    let t = time_to_expiry_years(expiry, Utc::now());
    for q in quotes.iter_mut() {
        let missing = q.iv.map(|v| v <= 0.0).unwrap_or(true);
        if !missing || q.last_price <= 0.0 {
            continue;
        }
        let is_call = q.side == OptionSide::CE;
        let (iv, iterations) =
            ctx.greeks_calc
                .implied_volatility(is_call, index_price, q.strike, t, q.last_price, 0.0);
        if iv > 0.0 {
            q.iv = Some(iv);
            ctx.metrics.inc("iv_estimations", &[index]);
            ctx.metrics.observe("iv_iterations", &[], iterations as f64);
        } else {
            ctx.metrics.inc("iv_fail", &[index]);
        }
    }
}

fn compute_missing_greeks(
    ctx: &ExpiryContext<'_>,
    index: &str,
    expiry: NaiveDate,
    index_price: f64,
    quotes: &mut [OptionQuote],
) {
    if !(index_price > 0.0) {
        return;
    }
    let t = time_to_expiry_years(expiry, Utc::now());
    for q in quotes.iter_mut() {
        if q.greeks.is_some() {
            continue;
        }
        let Some(iv) = q.iv.filter(|v| *v > 0.0) else {
            ctx.metrics.inc("greeks_fail", &[index]);
            continue;
        };
        let is_call = q.side == OptionSide::CE;
        let out = ctx
            .greeks_calc
            .black_scholes(is_call, index_price, q.strike, t, iv, 0.0);
        q.greeks = Some(Greeks {
            delta: out.delta,
            gamma: out.gamma,
            theta: out.theta,
            vega: out.vega,
            rho: out.rho,
        });
        ctx.metrics.inc("greeks_computed", &[index]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::greeks::OptionGreeks;
    use crate::metrics::gating::GroupGating;
    use crate::provider::sim::SimProvider;
    use crate::storage::CsvSink;
    use crate::strikes::build_strike_universe;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn end_to_end_expiry_produces_ok_or_partial() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let greeks = OptionGreeks::new(0.05);
        let ctx = ExpiryContext {
            provider: &provider,
            sink: &sink,
            metrics: &metrics,
            thresholds: StatusThresholds::default(),
            greeks_calc: &greeks,
            compute_greeks: true,
            estimate_iv: true,
            fallbacks: FallbackFlags {
                nearest: true,
                backward: false,
                relax: true,
            },
        };
        let atm = rt.block_on(provider.get_atm_strike("NIFTY")).unwrap();
        let price = rt.block_on(provider.get_ltp("NIFTY")).unwrap();
        let universe = build_strike_universe(atm, 2, 2, "NIFTY", None);
        let outcome = rt.block_on(process_expiry(
            &ctx,
            "NIFTY",
            ExpiryRule::ThisWeek,
            &universe,
            atm,
            price,
        ));
        assert!(!outcome.record.failed);
        assert!(outcome.record.options > 0);
        assert!(outcome.record.strike_coverage > 0.9);
        assert!(matches!(
            outcome.record.status,
            ExpiryStatus::Ok | ExpiryStatus::Partial
        ));
        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.option_count(), outcome.record.options);
        // IV and greeks were attached to priced quotes.
        assert!(snapshot
            .options
            .iter()
            .any(|q| q.iv.is_some() && q.greeks.is_some()));
        assert_eq!(outcome.rows.len(), outcome.record.options);
        assert!(outcome.sink_payload.is_some());
    }

    #[test]
    fn unknown_index_marks_expiry_failed() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let greeks = OptionGreeks::new(0.05);
        let ctx = ExpiryContext {
            provider: &provider,
            sink: &sink,
            metrics: &metrics,
            thresholds: StatusThresholds::default(),
            greeks_calc: &greeks,
            compute_greeks: false,
            estimate_iv: false,
            fallbacks: FallbackFlags {
                nearest: false,
                backward: false,
                relax: false,
            },
        };
        let universe = build_strike_universe(20000.0, 2, 2, "UNKNOWN", None);
        let outcome = rt.block_on(process_expiry(
            &ctx,
            "UNKNOWN",
            ExpiryRule::ThisWeek,
            &universe,
            20000.0,
            20000.0,
        ));
        assert!(outcome.record.failed);
        assert_eq!(outcome.record.status, ExpiryStatus::Empty);
        assert!(metrics.counter_value("index_errors", &["UNKNOWN", "no_data"]).unwrap() >= 1.0);
    }
}
