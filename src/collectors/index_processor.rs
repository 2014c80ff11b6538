//! Per-index cycle workflow.
//!
//! Price/OHLC fetch, ATM resolution with rounding fallback, memory and
//! adaptive strike scaling, per-expiry processing, stale detection and
//! overview emission.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::expiry_processor::{process_expiry, ExpiryContext, FallbackFlags};
use super::memory_adjust::{apply_memory_and_adaptive_scaling, MemFlags};
use super::status_reducer::{aggregate_cycle_status, StatusThresholds};
use crate::analytics::greeks::OptionGreeks;
use crate::config::{CycleConfig, StaleWriteMode};
use crate::metrics::MetricsRegistry;
use crate::models::{
    CycleStatus, ExpiryRecord, ExpirySnapshot, ExpiryStatus, IndexParams, OptionSnapshotRow,
    OverviewSnapshot,
};
use crate::provider::{atm_from_price, Provider};
use crate::snapshots::SnapshotCache;
use crate::storage::OptionsSink;
use crate::strikes::build_strike_universe;

pub struct IndexOutcome {
    pub status: CycleStatus,
    pub snapshots: Vec<ExpirySnapshot>,
    pub rows: Vec<OptionSnapshotRow>,
    pub price: f64,
    pub allow_per_option_metrics: bool,
}

fn empty_outcome(index: &str) -> IndexOutcome {
    IndexOutcome {
        status: CycleStatus {
            index: index.to_string(),
            attempts: 0,
            failures: 0,
            option_count: 0,
            status: ExpiryStatus::Empty,
            expiries: Vec::new(),
            stale: false,
        },
        snapshots: Vec::new(),
        rows: Vec::new(),
        price: 0.0,
        allow_per_option_metrics: true,
    }
}

pub async fn process_index(
    provider: &dyn Provider,
    sink: &dyn OptionsSink,
    metrics: &MetricsRegistry,
    params: &IndexParams,
    cfg: &CycleConfig,
    mem_flags: MemFlags,
    thresholds: StatusThresholds,
    snapshot_cache: &SnapshotCache,
) -> IndexOutcome {
    if !params.enabled {
        return empty_outcome(&params.name);
    }
    let index = params.name.as_str();
    debug!(index, "collecting index");

    // Index price + OHLC.
    let t0 = Instant::now();
    let index_price = match provider.get_index_data(index).await {
        Ok((price, _ohlc)) => {
            metrics.mark_api_call(true, t0.elapsed().as_secs_f64() * 1000.0);
            price
        }
        Err(e) => {
            metrics.mark_api_call(false, t0.elapsed().as_secs_f64() * 1000.0);
            metrics.inc("index_errors", &[index, e.kind()]);
            warn!(index, error = %e, "index data fetch failed");
            0.0
        }
    };

    // ATM with LTP-rounding fallback.
    let t1 = Instant::now();
    let mut atm_strike = match provider.get_atm_strike(index).await {
        Ok(atm) => atm,
        Err(e) => {
            debug!(index, error = %e, "broker ATM missing; deriving from price");
            0.0
        }
    };
    if !(atm_strike > 0.0) {
        atm_strike = atm_from_price(index, index_price);
    }
    metrics.mark_api_call(atm_strike > 0.0, t1.elapsed().as_secs_f64() * 1000.0);
    metrics.record_index_price(index, index_price);
    metrics.set("index_atm", &[index], atm_strike);

    if !(atm_strike > 0.0) {
        warn!(index, atm = atm_strike, "invalid ATM strike; marking expiries failed");
        metrics.inc("index_errors", &[index, "atm_zero"]);
        let failed: Vec<ExpiryRecord> = params
            .expiries
            .iter()
            .map(|rule| ExpiryRecord {
                rule: *rule,
                expiry_date: None,
                status: ExpiryStatus::Empty,
                options: 0,
                strike_coverage: 0.0,
                field_coverage: 0.0,
                partial_reason: None,
                failed: true,
            })
            .collect();
        let n = failed.len() as u32;
        return IndexOutcome {
            status: CycleStatus {
                index: index.to_string(),
                attempts: n,
                failures: n,
                option_count: 0,
                status: ExpiryStatus::Empty,
                expiries: failed,
                stale: false,
            },
            snapshots: Vec::new(),
            rows: Vec::new(),
            price: index_price,
            allow_per_option_metrics: true,
        };
    }

    let scaling = apply_memory_and_adaptive_scaling(
        params.strikes_itm,
        params.strikes_otm,
        mem_flags,
        cfg.compute_greeks,
        cfg.estimate_iv,
    );
    let universe = build_strike_universe(
        atm_strike,
        scaling.itm,
        scaling.otm,
        index,
        scaling.scale_factor,
    );
    if universe.strikes.is_empty() {
        warn!(index, atm = atm_strike, "strike universe empty");
    }

    let greeks_calc = OptionGreeks::new(cfg.risk_free_rate);
    let ctx = ExpiryContext {
        provider,
        sink,
        metrics,
        thresholds,
        greeks_calc: &greeks_calc,
        compute_greeks: scaling.compute_greeks,
        estimate_iv: scaling.estimate_iv,
        fallbacks: FallbackFlags::from_env(),
    };

    let mut records: Vec<ExpiryRecord> = Vec::with_capacity(params.expiries.len());
    let mut snapshots: Vec<ExpirySnapshot> = Vec::new();
    let mut rows: Vec<OptionSnapshotRow> = Vec::new();
    let mut attempts = 0u32;
    let mut failures = 0u32;
    for rule in &params.expiries {
        attempts += 1;
        let outcome = process_expiry(&ctx, index, *rule, &universe, atm_strike, index_price).await;
        if outcome.record.failed {
            failures += 1;
        }
        if !outcome.contamination.is_empty() {
            debug!(index, samples = ?outcome.contamination, "foreign roots sampled during filtering");
        }
        records.push(outcome.record);
        if let Some(snapshot) = outcome.snapshot {
            snapshot_cache.record(snapshot.clone());
            snapshots.push(snapshot);
        }
        rows.extend(outcome.rows);
    }

    let option_count: usize = records.iter().map(|r| r.options).sum();

    // Stale detection: options were produced but every expiry's field
    // coverage sits at/below the stale ceiling.
    let stale = option_count > 0
        && records
            .iter()
            .all(|r| r.field_coverage <= cfg.stale_field_cov_threshold);
    let mut status = aggregate_cycle_status(&records);
    if stale {
        status = ExpiryStatus::Stale;
    }

    let overview = OverviewSnapshot::from_expiry_snapshots(&snapshots);
    let suppress_overview = stale && cfg.stale_write_mode == StaleWriteMode::Skip;
    if suppress_overview {
        info!(index, "stale cycle; overview write suppressed");
    } else {
        let mark_stale = stale && cfg.stale_write_mode != StaleWriteMode::Allow;
        match sink.write_overview_snapshot(index, &overview, mark_stale) {
            Ok(()) => metrics.inc("overview_writes", &[index]),
            Err(e) => {
                warn!(index, error = %e, "overview persistence failed");
                metrics.inc("persist_errors", &["overview"]);
            }
        }
    }

    IndexOutcome {
        status: CycleStatus {
            index: index.to_string(),
            attempts,
            failures,
            option_count,
            status,
            expiries: records,
            stale,
        },
        snapshots,
        rows,
        price: index_price,
        allow_per_option_metrics: scaling.allow_per_option_metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;
    use crate::metrics::gating::GroupGating;
    use crate::models::ExpiryRule;
    use crate::provider::sim::SimProvider;
    use crate::storage::CsvSink;
    use std::time::Duration;

    fn cycle_cfg() -> CycleConfig {
        CycleConfig {
            interval: Duration::from_secs(60),
            stale_write_mode: StaleWriteMode::Mark,
            stale_field_cov_threshold: 0.05,
            compute_greeks: true,
            estimate_iv: true,
            risk_free_rate: 0.05,
            parallel_indices: false,
            runtime_status_path: "data/runtime_status.json".into(),
            benchmark_dump_dir: None,
            benchmark_compress: false,
            benchmark_keep_n: 5,
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn full_index_cycle_produces_status_and_snapshots() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let cache = SnapshotCache::new(true, 16);
        let params = IndexParams::new(
            "NIFTY",
            vec![ExpiryRule::ThisWeek, ExpiryRule::NextWeek],
            3,
            3,
        );
        let outcome = rt.block_on(process_index(
            &provider,
            &sink,
            &metrics,
            &params,
            &cycle_cfg(),
            MemFlags::default(),
            StatusThresholds::default(),
            &cache,
        ));
        assert_eq!(outcome.status.attempts, 2);
        assert_eq!(outcome.status.failures, 0);
        assert!(outcome.status.option_count > 0);
        assert_eq!(outcome.snapshots.len(), 2);
        assert_eq!(cache.len(), 2);
        assert!(!outcome.status.stale);
        assert!(outcome.price > 0.0);
        // Overview artifact landed on disk.
        assert!(dir.path().join("overview/NIFTY").is_dir());
    }

    #[test]
    fn disabled_index_is_skipped() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let cache = SnapshotCache::new(false, 16);
        let mut params = IndexParams::new("NIFTY", vec![ExpiryRule::ThisWeek], 3, 3);
        params.enabled = false;
        let outcome = rt.block_on(process_index(
            &provider,
            &sink,
            &metrics,
            &params,
            &cycle_cfg(),
            MemFlags::default(),
            StatusThresholds::default(),
            &cache,
        ));
        assert_eq!(outcome.status.attempts, 0);
        assert!(outcome.snapshots.is_empty());
    }

    #[test]
    fn unknown_index_marks_all_expiries_failed() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let cache = SnapshotCache::new(false, 16);
        let params = IndexParams::new(
            "UNKNOWN",
            vec![ExpiryRule::ThisWeek, ExpiryRule::ThisMonth],
            3,
            3,
        );
        let outcome = rt.block_on(process_index(
            &provider,
            &sink,
            &metrics,
            &params,
            &cycle_cfg(),
            MemFlags::default(),
            StatusThresholds::default(),
            &cache,
        ));
        assert_eq!(outcome.status.attempts, 2);
        assert_eq!(outcome.status.failures, 2);
        assert_eq!(outcome.status.status, ExpiryStatus::Empty);
        assert!(outcome.status.expiries.iter().all(|r| r.failed));
        assert_eq!(
            metrics.counter_value("index_errors", &["UNKNOWN", "atm_zero"]),
            Some(1.0)
        );
    }

    #[test]
    fn memory_pressure_shrinks_universe_and_disables_greeks() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let provider = SimProvider::new();
        let sink = CsvSink::new(dir.path());
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let cache = SnapshotCache::new(false, 16);
        let params = IndexParams::new("NIFTY", vec![ExpiryRule::ThisWeek], 10, 10);
        let flags = MemFlags {
            depth_scale: 0.2,
            skip_greeks: true,
            drop_per_option_metrics: true,
        };
        let outcome = rt.block_on(process_index(
            &provider,
            &sink,
            &metrics,
            &params,
            &cycle_cfg(),
            flags,
            StatusThresholds::default(),
            &cache,
        ));
        // 2 strikes per side + ATM, both CE and PE.
        assert_eq!(outcome.status.option_count, 10);
        assert!(!outcome.allow_per_option_metrics);
        let snap = &outcome.snapshots[0];
        assert!(snap.options.iter().all(|q| q.greeks.is_none()));
    }
}
