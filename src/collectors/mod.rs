//! Collection orchestrator.
//!
//! Drives the periodic cycle: per-index collection, per-option metric
//! emission through the cardinality gate, analytics builders feeding the
//! adaptive guards, status + panel artifacts, snapshot guard enforcement
//! and the benchmark artifact.

pub mod benchmark;
pub mod coverage;
pub mod expiry_processor;
pub mod index_processor;
pub mod memory_adjust;
pub mod status_reducer;

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::adaptive::FollowupEngine;
use crate::analytics::{build_risk, build_surface, RiskAggConfig, VolSurfaceConfig};
use crate::config::{env_str, env_u64, CycleConfig, StaleWriteMode};
use crate::events::EventBus;
use crate::metrics::cardinality::CardinalityManager;
use crate::metrics::gating::GROUP_CARDINALITY;
use crate::metrics::spec::MetricKind;
use crate::metrics::MetricsRegistry;
use crate::models::{CycleStatus, ExpiryRule, IndexParams, OptionSnapshotRow};
use crate::provider::Provider;
use crate::snapshots::SnapshotCache;
use crate::status::{PanelDiffEmitter, StatusInputs, StatusWriter};
use crate::storage::OptionsSink;
use self::benchmark::BenchmarkWriter;
use self::index_processor::{process_index, IndexOutcome};
use self::memory_adjust::MemFlags;
use self::status_reducer::StatusThresholds;

/// Index roster from env: `G6_INDICES` (comma separated), depth via
/// `G6_STRIKES_ITM`/`G6_STRIKES_OTM`, rules via `G6_EXPIRY_RULES`.
pub fn default_index_params() -> Vec<IndexParams> {
    let names = env_str("G6_INDICES", "NIFTY,BANKNIFTY,FINNIFTY,SENSEX");
    let itm = env_u64("G6_STRIKES_ITM", 10) as u32;
    let otm = env_u64("G6_STRIKES_OTM", 10) as u32;
    let rules: Vec<ExpiryRule> = env_str(
        "G6_EXPIRY_RULES",
        "this_week,next_week,this_month,next_month",
    )
    .split(',')
    .filter_map(ExpiryRule::parse)
    .collect();
    names
        .split(',')
        .map(|n| n.trim().to_ascii_uppercase())
        .filter(|n| !n.is_empty())
        .map(|name| IndexParams::new(&name, rules.clone(), itm, otm))
        .collect()
}

pub struct CycleSummary {
    pub cycle: u64,
    pub duration_s: f64,
    pub options_total: usize,
    pub statuses: Vec<CycleStatus>,
    pub aborted: bool,
}

pub struct CycleDriver {
    provider: Arc<dyn Provider>,
    sink: Arc<dyn OptionsSink>,
    metrics: Arc<MetricsRegistry>,
    bus: Arc<EventBus>,
    snapshots: Arc<SnapshotCache>,
    followups: FollowupEngine,
    cardinality: CardinalityManager,
    index_params: Vec<IndexParams>,
    cycle_cfg: CycleConfig,
    surface_cfg: VolSurfaceConfig,
    risk_cfg: RiskAggConfig,
    status_writer: StatusWriter,
    panel_emitter: PanelDiffEmitter,
    benchmark: Option<BenchmarkWriter>,
    provider_name: String,
    cycle: u64,
    root_cache_exported: (u64, u64, u64),
}

impl CycleDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn Provider>,
        provider_name: &str,
        sink: Arc<dyn OptionsSink>,
        metrics: Arc<MetricsRegistry>,
        bus: Arc<EventBus>,
        snapshots: Arc<SnapshotCache>,
        index_params: Vec<IndexParams>,
        cycle_cfg: CycleConfig,
    ) -> Self {
        let mut followups = FollowupEngine::from_env(metrics.clone());
        followups.set_bus(bus.clone());
        let mut cardinality = CardinalityManager::from_env();
        cardinality.set_metrics(metrics.clone());
        // High-cardinality per-option series live behind the manager.
        for (attr, name, help) in [
            (
                "option_price",
                "g6_option_price",
                "Last traded price per option",
            ),
            ("option_oi", "g6_option_oi", "Open interest per option"),
        ] {
            let _ = metrics.maybe_register(
                GROUP_CARDINALITY,
                attr,
                MetricKind::Gauge,
                name,
                help,
                &["index", "expiry", "strike", "type"],
            );
        }
        let status_writer = StatusWriter::new(&cycle_cfg.runtime_status_path, metrics.clone());
        let panel_emitter = PanelDiffEmitter::new(bus.clone(), metrics.clone());
        let benchmark = cycle_cfg.benchmark_dump_dir.as_ref().map(|dir| {
            BenchmarkWriter::new(dir, cycle_cfg.benchmark_compress, cycle_cfg.benchmark_keep_n)
        });
        Self {
            provider,
            sink,
            metrics,
            bus,
            snapshots,
            followups,
            cardinality,
            index_params,
            cycle_cfg,
            surface_cfg: VolSurfaceConfig::from_env(),
            risk_cfg: RiskAggConfig::from_env(),
            status_writer,
            panel_emitter,
            benchmark,
            provider_name: provider_name.to_string(),
            cycle: 0,
            root_cache_exported: (0, 0, 0),
        }
    }

    /// Push root-cache stats into the registry: gauges carry state, the
    /// counters receive the delta since the previous export.
    fn export_root_cache_stats(&mut self) {
        let stats = crate::filters::root_cache::root_cache_stats();
        let (prev_hits, prev_misses, prev_evictions) = self.root_cache_exported;
        self.metrics
            .add("root_cache_hits", &[], stats.hits.saturating_sub(prev_hits) as f64);
        self.metrics.add(
            "root_cache_misses",
            &[],
            stats.misses.saturating_sub(prev_misses) as f64,
        );
        self.metrics.add(
            "root_cache_evictions",
            &[],
            stats.evictions.saturating_sub(prev_evictions) as f64,
        );
        self.metrics.set("root_cache_size", &[], stats.size as f64);
        if let Some(ratio) = stats.hit_ratio {
            self.metrics.set("root_cache_hit_ratio", &[], ratio);
        }
        self.root_cache_exported = (stats.hits, stats.misses, stats.evictions);
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.cycle += 1;
        let cycle = self.cycle;
        self.followups.set_cycle(cycle);
        let start = Instant::now();
        let mut phase_times: BTreeMap<String, f64> = BTreeMap::new();
        let mut phase_failures: BTreeMap<String, u64> = BTreeMap::new();

        let mem_flags = MemFlags::from_env();
        let thresholds = StatusThresholds::from_env();

        // Phase: collect.
        let collect_start = Instant::now();
        let mut outcomes: Vec<IndexOutcome> = if self.cycle_cfg.parallel_indices {
            join_all(self.index_params.iter().map(|params| {
                process_index(
                    self.provider.as_ref(),
                    self.sink.as_ref(),
                    &self.metrics,
                    params,
                    &self.cycle_cfg,
                    mem_flags,
                    thresholds,
                    &self.snapshots,
                )
            }))
            .await
        } else {
            let mut out = Vec::with_capacity(self.index_params.len());
            for params in &self.index_params {
                out.push(
                    process_index(
                        self.provider.as_ref(),
                        self.sink.as_ref(),
                        &self.metrics,
                        params,
                        &self.cycle_cfg,
                        mem_flags,
                        thresholds,
                        &self.snapshots,
                    )
                    .await,
                );
            }
            out
        };
        phase_times.insert("collect".into(), collect_start.elapsed().as_secs_f64());
        self.export_root_cache_stats();
        let collect_failures: u64 = outcomes.iter().map(|o| o.status.failures as u64).sum();
        if collect_failures > 0 {
            phase_failures.insert("collect".into(), collect_failures);
        }

        // Phase: per-option metric emission behind the cardinality gate.
        let emit_start = Instant::now();
        for outcome in &outcomes {
            if !outcome.allow_per_option_metrics {
                continue;
            }
            for snap in &outcome.snapshots {
                let expiry = snap.expiry_date.to_string();
                for q in &snap.options {
                    let emit = self.cardinality.should_emit(
                        &snap.index,
                        &expiry,
                        q.strike,
                        q.side,
                        Some(snap.atm_strike),
                        Some(q.last_price),
                    );
                    if emit {
                        let strike_label = format!("{}", q.strike as i64);
                        let labels = [
                            snap.index.as_str(),
                            expiry.as_str(),
                            strike_label.as_str(),
                            q.side.as_str(),
                        ];
                        self.metrics.set("option_price", &labels, q.last_price);
                        self.metrics.set("option_oi", &labels, q.oi as f64);
                    }
                }
            }
        }
        phase_times.insert("per_option_metrics".into(), emit_start.elapsed().as_secs_f64());

        let aborted = self.cycle_cfg.stale_write_mode == StaleWriteMode::Abort
            && outcomes.iter().any(|o| o.status.stale);
        if aborted {
            error!(cycle, "stale index with abort mode; halting cycle");
        }

        // Phase: analytics (skipped when aborting).
        if !aborted {
            let analytics_start = Instant::now();
            let mut rows: Vec<OptionSnapshotRow> = Vec::new();
            for outcome in &mut outcomes {
                rows.append(&mut outcome.rows);
            }
            build_surface(&rows, &self.surface_cfg, &self.metrics, Some(&mut self.followups));
            build_risk(&rows, &self.risk_cfg, &self.metrics, Some(&mut self.followups));
            if let Some(mode) = self.followups.apply_weight_demotion() {
                warn!(cycle, mode = mode.as_str(), "detail mode demoted by weight pressure");
            }
            phase_times.insert("analytics".into(), analytics_start.elapsed().as_secs_f64());
        }

        let statuses: Vec<CycleStatus> = outcomes.iter().map(|o| o.status.clone()).collect();
        let options_total: usize = statuses.iter().map(|s| s.option_count).sum();
        let elapsed = start.elapsed().as_secs_f64();

        // Phase: status + panel artifacts + snapshot guard.
        let status_start = Instant::now();
        let readiness_ok = !aborted && options_total > 0;
        let readiness_reason = if aborted {
            "stale abort".to_string()
        } else if options_total == 0 {
            "no options collected".to_string()
        } else {
            "ok".to_string()
        };
        let health = self.component_health(&statuses);
        let alerts = self.followups.recent_alerts(50);
        let inputs = StatusInputs {
            cycle,
            elapsed,
            interval: self.cycle_cfg.interval.as_secs_f64(),
            index_params: &self.index_params,
            statuses: &statuses,
            readiness_ok,
            readiness_reason,
            provider_name: &self.provider_name,
            health: &health,
            alerts: &alerts,
        };
        match self.status_writer.write(&inputs) {
            Ok(status_value) => {
                if let Err(e) = self.panel_emitter.emit(&status_value, self.status_writer.path()) {
                    warn!(error = %e, "panel artifact emission failed");
                }
            }
            Err(e) => warn!(error = %e, "runtime status write failed"),
        }
        self.bus.enforce_snapshot_guard();
        phase_times.insert("status".into(), status_start.elapsed().as_secs_f64());

        // Benchmark artifact is best-effort.
        if let Some(bw) = &self.benchmark {
            if let Err(e) =
                bw.write_artifact(&statuses, elapsed, &phase_times, &phase_failures, &self.metrics)
            {
                warn!(error = %e, "benchmark artifact write failed");
            }
        }

        self.metrics.mark_cycle(
            collect_failures == 0 && !aborted,
            elapsed,
            options_total as u64,
            self.cycle_cfg.interval.as_secs_f64(),
        );
        info!(cycle, options = options_total, elapsed_s = elapsed, "cycle complete");
        CycleSummary {
            cycle,
            duration_s: elapsed,
            options_total,
            statuses,
            aborted,
        }
    }

    fn component_health(&self, statuses: &[CycleStatus]) -> Vec<(String, String)> {
        let provider_healthy = statuses.iter().any(|s| s.failures < s.attempts)
            || statuses.iter().all(|s| s.attempts == 0);
        let collectors_healthy = statuses
            .iter()
            .all(|s| s.status != crate::models::ExpiryStatus::Empty || s.attempts == 0);
        vec![
            (
                "provider".to_string(),
                if provider_healthy { "healthy" } else { "degraded" }.to_string(),
            ),
            (
                "collectors".to_string(),
                if collectors_healthy { "healthy" } else { "degraded" }.to_string(),
            ),
            ("events".to_string(), {
                if self.bus.is_degraded() {
                    "degraded".to_string()
                } else {
                    "healthy".to_string()
                }
            }),
        ]
    }

    /// Run cycles on the configured interval until the shutdown flag flips.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cycle_cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_cycle().await;
                    if summary.aborted {
                        error!("cycle aborted by stale policy; stopping driver");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received; stopping collection loop");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::metrics::gating::GroupGating;
    use crate::provider::sim::SimProvider;
    use crate::storage::CsvSink;
    use std::time::Duration;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn driver(dir: &std::path::Path) -> CycleDriver {
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        let bus = Arc::new(EventBus::new(
            EventBusConfig::with_capacity(512),
            metrics.clone(),
        ));
        let snapshots = Arc::new(SnapshotCache::new(true, 64));
        let cycle_cfg = CycleConfig {
            interval: Duration::from_secs(60),
            stale_write_mode: StaleWriteMode::Mark,
            stale_field_cov_threshold: 0.05,
            compute_greeks: true,
            estimate_iv: true,
            risk_free_rate: 0.05,
            parallel_indices: false,
            runtime_status_path: dir
                .join("runtime_status.json")
                .to_string_lossy()
                .into_owned(),
            benchmark_dump_dir: Some(dir.join("bench").to_string_lossy().into_owned()),
            benchmark_compress: false,
            benchmark_keep_n: 3,
        };
        let params = vec![IndexParams::new(
            "NIFTY",
            vec![ExpiryRule::ThisWeek, ExpiryRule::NextWeek],
            3,
            3,
        )];
        let mut d = CycleDriver::new(
            Arc::new(SimProvider::new()),
            "SimProvider",
            Arc::new(CsvSink::new(dir.join("csv"))),
            metrics,
            bus,
            snapshots,
            params,
            cycle_cfg,
        );
        d.surface_cfg = VolSurfaceConfig {
            enabled: true,
            interpolate: true,
            ..VolSurfaceConfig::default()
        };
        d.risk_cfg = RiskAggConfig {
            enabled: true,
            ..RiskAggConfig::default()
        };
        d
    }

    #[test]
    fn full_cycle_produces_artifacts_and_events() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let summary = rt.block_on(driver.run_cycle());
        assert_eq!(summary.cycle, 1);
        assert!(!summary.aborted);
        assert!(summary.options_total > 0);
        assert_eq!(summary.statuses.len(), 1);
        assert_eq!(summary.statuses[0].failures, 0);

        // Status + panel artifacts.
        assert!(dir.path().join("runtime_status.json").exists());
        assert!(dir.path().join("panel_full.json").exists());
        // Benchmark artifact present.
        let bench_files: Vec<_> = std::fs::read_dir(dir.path().join("bench"))
            .unwrap()
            .collect();
        assert_eq!(bench_files.len(), 1);

        // The bus carries the coalesced panel_full baseline.
        let events = driver.bus.get_since(0, None);
        assert!(events.iter().any(|e| e.event_type == "panel_full"));

        // Analytics gauges were populated.
        assert!(driver.metrics.gauge_value("risk_agg_rows", &[]).unwrap() > 0.0);
        assert!(driver
            .metrics
            .counter_value("vol_surface_builds", &["global"])
            .unwrap()
            > 0.0);
    }

    #[test]
    fn second_cycle_emits_panel_diff() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        rt.block_on(driver.run_cycle());
        rt.block_on(driver.run_cycle());
        assert!(dir.path().join("panel_1.diff.json").exists());
        let events = driver.bus.get_since(0, None);
        assert!(events.iter().any(|e| e.event_type == "panel_diff"));
    }

    #[test]
    fn per_option_gauges_respect_detail_mode() {
        let rt = rt();
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        driver.metrics.set_detail_mode(crate::metrics::DetailMode::Agg, None);
        rt.block_on(driver.run_cycle());
        // Aggregate mode suppresses every per-option emission.
        assert_eq!(
            driver
                .metrics
                .counter_value("metric_sampling_events", &["option", "reject", "detail_mode_agg"])
                .map(|v| v > 0.0),
            Some(true)
        );
    }
}
