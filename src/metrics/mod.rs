//! Prometheus metrics registry.
//!
//! Declaratively-specified collectors (see [`spec`]) registered behind group
//! gating, with a cardinality manager for the high-cardinality per-option
//! series. Observability failures are swallowed throughout: the collection
//! path must keep running when a register/update fails.

pub mod cardinality;
pub mod gating;
pub mod spec;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use self::gating::{GroupGating, GROUP_PANEL_DIFF, GROUP_VOL_SURFACE};
use self::spec::{metric_specs, MetricDef, MetricKind};

/// Adaptive per-option detail tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailMode {
    Full,
    Band,
    Agg,
}

impl DetailMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DetailMode::Full => 0,
            DetailMode::Band => 1,
            DetailMode::Agg => 2,
        }
    }

    pub fn from_u8(v: u8) -> DetailMode {
        match v {
            2 => DetailMode::Agg,
            1 => DetailMode::Band,
            _ => DetailMode::Full,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetailMode::Full => "full",
            DetailMode::Band => "band",
            DetailMode::Agg => "agg",
        }
    }
}

/// Concrete collector handle stored per attr.
#[derive(Clone)]
pub enum MetricHandle {
    Counter(Counter),
    CounterVec(CounterVec),
    Gauge(Gauge),
    GaugeVec(GaugeVec),
    Histogram(Histogram),
    HistogramVec(HistogramVec),
}

impl MetricHandle {
    fn unregister_from(&self, registry: &Registry) {
        let result = match self {
            MetricHandle::Counter(c) => registry.unregister(Box::new(c.clone())),
            MetricHandle::CounterVec(c) => registry.unregister(Box::new(c.clone())),
            MetricHandle::Gauge(g) => registry.unregister(Box::new(g.clone())),
            MetricHandle::GaugeVec(g) => registry.unregister(Box::new(g.clone())),
            MetricHandle::Histogram(h) => registry.unregister(Box::new(h.clone())),
            MetricHandle::HistogramVec(h) => registry.unregister(Box::new(h.clone())),
        };
        if let Err(e) = result {
            debug!(error = %e, "collector unregister failed");
        }
    }
}

/// Counters must expose their spec name verbatim. Guard against an
/// accidentally doubled suffix from upstream catalog edits.
pub fn normalize_counter_name(name: &str) -> String {
    if let Some(stripped) = name.strip_suffix("_total_total") {
        format!("{stripped}_total")
    } else {
        name.to_string()
    }
}

#[derive(Default)]
struct ApiStats {
    calls: u64,
    failures: u64,
    latency_ema_ms: Option<f64>,
}

#[derive(Default)]
struct CycleBook {
    total: u64,
    success: u64,
    last_cycle_options: u64,
}

#[derive(Default)]
struct ModeChangeMeta {
    count: u64,
    last_change_cycle: Option<u64>,
    last_change_unixtime: Option<f64>,
}

pub struct MetricsRegistry {
    registry: Registry,
    handles: RwLock<HashMap<String, MetricHandle>>,
    metric_groups: RwLock<HashMap<String, String>>,
    gating: GroupGating,
    adaptive_mode: AtomicU8,
    adaptive_mode_meta: Mutex<ModeChangeMeta>,
    api: Mutex<ApiStats>,
    cycle: Mutex<CycleBook>,
    latest_index_prices: Mutex<HashMap<String, f64>>,
}

impl MetricsRegistry {
    /// Fresh registry with explicit gating (tests inject `allow_all`).
    pub fn new(gating: GroupGating) -> Self {
        let reg = Self {
            registry: Registry::new(),
            handles: RwLock::new(HashMap::new()),
            metric_groups: RwLock::new(HashMap::new()),
            gating,
            adaptive_mode: AtomicU8::new(0),
            adaptive_mode_meta: Mutex::new(ModeChangeMeta::default()),
            api: Mutex::new(ApiStats::default()),
            cycle: Mutex::new(CycleBook::default()),
            latest_index_prices: Mutex::new(HashMap::new()),
        };
        reg.register_spec_catalog();
        reg.apply_pruning();
        reg.run_post_init_recovery();
        reg
    }

    pub fn from_env() -> Self {
        Self::new(GroupGating::from_env())
    }

    pub fn gating(&self) -> &GroupGating {
        &self.gating
    }

    pub fn prometheus(&self) -> &Registry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------
    fn register_spec_catalog(&self) {
        for def in metric_specs() {
            if let Some(pred) = def.predicate {
                if !pred() {
                    continue;
                }
            }
            self.register_def(&def);
        }
    }

    fn register_def(&self, def: &MetricDef) {
        let handle = match self.build_collector(def) {
            Some(h) => h,
            None => return,
        };
        self.handles.write().insert(def.attr.to_string(), handle);
        if let Some(group) = def.group {
            self.metric_groups
                .write()
                .insert(def.attr.to_string(), group.to_string());
        }
    }

    fn build_collector(&self, def: &MetricDef) -> Option<MetricHandle> {
        let name = match def.kind {
            MetricKind::Counter => normalize_counter_name(def.name),
            _ => def.name.to_string(),
        };
        let result: Result<MetricHandle, prometheus::Error> = match def.kind {
            MetricKind::Counter => {
                if def.labels.is_empty() {
                    Counter::with_opts(Opts::new(name, def.help)).and_then(|c| {
                        self.registry.register(Box::new(c.clone()))?;
                        Ok(MetricHandle::Counter(c))
                    })
                } else {
                    CounterVec::new(Opts::new(name, def.help), def.labels).and_then(|c| {
                        self.registry.register(Box::new(c.clone()))?;
                        Ok(MetricHandle::CounterVec(c))
                    })
                }
            }
            MetricKind::Gauge => {
                if def.labels.is_empty() {
                    Gauge::with_opts(Opts::new(name, def.help)).and_then(|g| {
                        self.registry.register(Box::new(g.clone()))?;
                        Ok(MetricHandle::Gauge(g))
                    })
                } else {
                    GaugeVec::new(Opts::new(name, def.help), def.labels).and_then(|g| {
                        self.registry.register(Box::new(g.clone()))?;
                        Ok(MetricHandle::GaugeVec(g))
                    })
                }
            }
            MetricKind::Histogram | MetricKind::Summary => {
                if def.labels.is_empty() {
                    Histogram::with_opts(HistogramOpts::new(name, def.help)).and_then(|h| {
                        self.registry.register(Box::new(h.clone()))?;
                        Ok(MetricHandle::Histogram(h))
                    })
                } else {
                    HistogramVec::new(HistogramOpts::new(name, def.help), def.labels).and_then(|h| {
                        self.registry.register(Box::new(h.clone()))?;
                        Ok(MetricHandle::HistogramVec(h))
                    })
                }
            }
        };
        match result {
            Ok(h) => Some(h),
            Err(e) => {
                // Duplicate registration or invalid spec: swallow, the
                // recovery pass may re-attempt.
                debug!(attr = def.attr, error = %e, "metric registration failed");
                None
            }
        }
    }

    /// Idempotent dynamic registration used by the event bus, followups and
    /// flag-gated analytics variants. Returns the existing handle when the
    /// attr is already present; `None` when the group is gated off.
    pub fn maybe_register(
        &self,
        group: &'static str,
        attr: &str,
        kind: MetricKind,
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Option<MetricHandle> {
        if let Some(existing) = self.handles.read().get(attr) {
            return Some(existing.clone());
        }
        if !self.gating.group_allowed(group) {
            return None;
        }
        let def = MetricDef {
            attr: "",
            name,
            help,
            kind,
            labels,
            group: Some(group),
            predicate: None,
        };
        let handle = self.build_collector(&def)?;
        self.handles.write().insert(attr.to_string(), handle.clone());
        self.metric_groups
            .write()
            .insert(attr.to_string(), group.to_string());
        Some(handle)
    }

    /// Unregister collectors belonging to disallowed controlled groups.
    fn apply_pruning(&self) {
        let groups = self.metric_groups.read().clone();
        for (attr, group) in groups {
            if self.gating.prunable(&group) {
                if let Some(handle) = self.handles.write().remove(&attr) {
                    handle.unregister_from(&self.registry);
                }
                self.metric_groups.write().remove(&attr);
            }
        }
    }

    /// Post-init recovery: a small set of metrics must exist regardless of
    /// how registration went, because late consumers assume them.
    fn run_post_init_recovery(&self) {
        if !self.handles.read().contains_key("panel_diff_truncated") {
            let _ = self.maybe_register(
                GROUP_PANEL_DIFF,
                "panel_diff_truncated",
                MetricKind::Counter,
                "g6_panel_diff_truncated_total",
                "Panel diffs truncated at the nesting depth bound",
                &[],
            );
            if !self.handles.read().contains_key("panel_diff_truncated") {
                // Group disabled: register ungated so the fallback exists.
                self.register_def(&MetricDef {
                    attr: "panel_diff_truncated",
                    name: "g6_panel_diff_truncated_total",
                    help: "Panel diffs truncated at the nesting depth bound",
                    kind: MetricKind::Counter,
                    labels: &[],
                    group: None,
                    predicate: None,
                });
            }
        }
        if self.gating.group_allowed(GROUP_VOL_SURFACE)
            && !self.handles.read().contains_key("vol_surface_quality_score")
        {
            let _ = self.maybe_register(
                GROUP_VOL_SURFACE,
                "vol_surface_quality_score",
                MetricKind::Gauge,
                "g6_vol_surface_quality_score",
                "Surface quality heuristic: coverage x (1 - interp fraction)",
                &["index"],
            );
        }
        // Event-gap detection needs this gauge even before the first publish.
        self.register_def(&MetricDef {
            attr: "events_last_full_unixtime",
            name: "g6_events_last_full_unixtime",
            help: "Unix timestamp of last panel_full event published",
            kind: MetricKind::Gauge,
            labels: &[],
            group: None,
            predicate: None,
        });
        self.set("events_last_full_unixtime", &[], unix_now());
    }

    // ------------------------------------------------------------------
    // Handle access & best-effort updates
    // ------------------------------------------------------------------
    pub fn handle(&self, attr: &str) -> Option<MetricHandle> {
        self.handles.read().get(attr).cloned()
    }

    pub fn has_metric(&self, attr: &str) -> bool {
        self.handles.read().contains_key(attr)
    }

    pub fn group_of(&self, attr: &str) -> Option<String> {
        self.metric_groups.read().get(attr).cloned()
    }

    pub fn inc(&self, attr: &str, label_values: &[&str]) {
        self.add(attr, label_values, 1.0);
    }

    pub fn add(&self, attr: &str, label_values: &[&str], amount: f64) {
        match self.handle(attr) {
            Some(MetricHandle::Counter(c)) => c.inc_by(amount),
            Some(MetricHandle::CounterVec(c)) => c.with_label_values(label_values).inc_by(amount),
            _ => {}
        }
    }

    pub fn set(&self, attr: &str, label_values: &[&str], value: f64) {
        match self.handle(attr) {
            Some(MetricHandle::Gauge(g)) => g.set(value),
            Some(MetricHandle::GaugeVec(g)) => g.with_label_values(label_values).set(value),
            _ => {}
        }
    }

    pub fn observe(&self, attr: &str, label_values: &[&str], value: f64) {
        match self.handle(attr) {
            Some(MetricHandle::Histogram(h)) => h.observe(value),
            Some(MetricHandle::HistogramVec(h)) => h.with_label_values(label_values).observe(value),
            _ => {}
        }
    }

    pub fn gauge_value(&self, attr: &str, label_values: &[&str]) -> Option<f64> {
        match self.handle(attr) {
            Some(MetricHandle::Gauge(g)) => Some(g.get()),
            Some(MetricHandle::GaugeVec(g)) => Some(g.with_label_values(label_values).get()),
            _ => None,
        }
    }

    pub fn counter_value(&self, attr: &str, label_values: &[&str]) -> Option<f64> {
        match self.handle(attr) {
            Some(MetricHandle::Counter(c)) => Some(c.get()),
            Some(MetricHandle::CounterVec(c)) => Some(c.with_label_values(label_values).get()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Adaptive detail mode (read by the cardinality manager)
    // ------------------------------------------------------------------
    pub fn detail_mode(&self) -> DetailMode {
        DetailMode::from_u8(self.adaptive_mode.load(Ordering::Relaxed))
    }

    pub fn set_detail_mode(&self, mode: DetailMode, cycle: Option<u64>) {
        let prev = self.adaptive_mode.swap(mode.as_u8(), Ordering::Relaxed);
        self.set("option_detail_mode", &[], mode.as_u8() as f64);
        if prev != mode.as_u8() {
            let mut meta = self.adaptive_mode_meta.lock();
            meta.count += 1;
            meta.last_change_cycle = cycle;
            meta.last_change_unixtime = Some(unix_now());
        }
    }

    pub fn detail_mode_change_meta(&self) -> (u64, Option<u64>, Option<f64>) {
        let meta = self.adaptive_mode_meta.lock();
        (meta.count, meta.last_change_cycle, meta.last_change_unixtime)
    }

    // ------------------------------------------------------------------
    // Cycle / API bookkeeping consumed by the status writer
    // ------------------------------------------------------------------
    pub fn mark_api_call(&self, success: bool, latency_ms: f64) {
        let mut api = self.api.lock();
        api.calls += 1;
        if !success {
            api.failures += 1;
        }
        api.latency_ema_ms = Some(match api.latency_ema_ms {
            Some(prev) => prev * 0.8 + latency_ms * 0.2,
            None => latency_ms,
        });
        let rate = if api.calls > 0 {
            ((api.calls - api.failures) as f64 / api.calls as f64) * 100.0
        } else {
            100.0
        };
        self.set("api_success_rate", &[], rate);
    }

    pub fn api_latency_ema_ms(&self) -> Option<f64> {
        self.api.lock().latency_ema_ms
    }

    pub fn mark_cycle(&self, success: bool, duration_s: f64, options: u64, interval_s: f64) {
        {
            let mut cycle = self.cycle.lock();
            cycle.total += 1;
            if success {
                cycle.success += 1;
            }
            cycle.last_cycle_options = options;
            let rate = (cycle.success as f64 / cycle.total as f64) * 100.0;
            self.set("cycle_success_rate", &[], rate);
        }
        self.inc("collection_cycles", &[]);
        self.observe("collection_cycle_seconds", &[], duration_s);
        if duration_s > 0.0 {
            self.set("cycles_per_hour", &[], 3600.0 / duration_s.max(interval_s));
            self.set(
                "options_per_minute",
                &[],
                options as f64 * 60.0 / duration_s.max(1e-9),
            );
        }
        if duration_s > interval_s && interval_s > 0.0 {
            self.inc("cycle_sla_breach", &[]);
        }
    }

    pub fn cycle_summary(&self) -> (u64, u64, u64) {
        let cycle = self.cycle.lock();
        (cycle.total, cycle.success, cycle.last_cycle_options)
    }

    pub fn record_index_price(&self, index: &str, price: f64) {
        if price > 0.0 {
            self.latest_index_prices
                .lock()
                .insert(index.to_string(), price);
        }
        self.set("index_price", &[index], price);
    }

    pub fn latest_index_price(&self, index: &str) -> Option<f64> {
        self.latest_index_prices.lock().get(index).copied()
    }

    // ------------------------------------------------------------------
    // Exposition
    // ------------------------------------------------------------------
    pub fn render_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

lazy_static! {
    static ref GLOBAL_METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::from_env());
}

/// Process-wide registry. Components take it as a parameter; this accessor
/// exists for the default wiring in `main` and legacy-style call sites.
pub fn get_metrics() -> Arc<MetricsRegistry> {
    GLOBAL_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;

    fn fresh() -> MetricsRegistry {
        MetricsRegistry::new(GroupGating::allow_all())
    }

    #[test]
    fn catalog_registers_and_updates() {
        let m = fresh();
        m.inc("collection_cycles", &[]);
        m.inc("index_errors", &["NIFTY", "atm_zero"]);
        m.set("index_price", &["NIFTY"], 20000.0);
        assert_eq!(m.counter_value("collection_cycles", &[]), Some(1.0));
        assert_eq!(m.counter_value("index_errors", &["NIFTY", "atm_zero"]), Some(1.0));
        assert_eq!(m.gauge_value("index_price", &["NIFTY"]), Some(20000.0));
    }

    #[test]
    fn disabled_group_is_pruned_but_always_on_survives() {
        let m = MetricsRegistry::new(GroupGating::from_lists("", "cache,sla_health"));
        assert!(!m.has_metric("root_cache_hits"));
        // sla_health is ALWAYS_ON: disable list must not remove it.
        assert!(m.has_metric("component_health"));
    }

    #[test]
    fn enable_list_restricts_controlled_groups() {
        let m = MetricsRegistry::new(GroupGating::from_lists("analytics_risk_agg", ""));
        assert!(m.has_metric("risk_agg_rows"));
        assert!(!m.has_metric("vol_surface_rows"));
        // Core (ungated) metrics are untouched by the allow-list.
        assert!(m.has_metric("collection_cycles"));
    }

    #[test]
    fn recovery_pass_ensures_fallback_metrics() {
        let m = MetricsRegistry::new(GroupGating::from_lists("", "panel_diff"));
        assert!(m.has_metric("panel_diff_truncated"));
        assert!(m.has_metric("events_last_full_unixtime"));
        assert!(m.gauge_value("events_last_full_unixtime", &[]).unwrap() > 0.0);
    }

    #[test]
    fn maybe_register_is_idempotent_and_group_gated() {
        let m = fresh();
        let first = m.maybe_register(
            gating::GROUP_SSE_INGEST,
            "events_published",
            MetricKind::Counter,
            "g6_events_published_total",
            "Events published",
            &["type"],
        );
        assert!(first.is_some());
        let second = m.maybe_register(
            gating::GROUP_SSE_INGEST,
            "events_published",
            MetricKind::Counter,
            "g6_events_published_total",
            "Events published",
            &["type"],
        );
        assert!(second.is_some());
        m.inc("events_published", &["panel_full"]);
        assert_eq!(m.counter_value("events_published", &["panel_full"]), Some(1.0));

        let gated = MetricsRegistry::new(GroupGating::from_lists("", "sse_ingest"));
        assert!(gated
            .maybe_register(
                gating::GROUP_SSE_INGEST,
                "events_published",
                MetricKind::Counter,
                "g6_events_published_total",
                "Events published",
                &["type"],
            )
            .is_none());
    }

    #[test]
    fn counter_name_normalization() {
        assert_eq!(normalize_counter_name("g6_x_total"), "g6_x_total");
        assert_eq!(normalize_counter_name("g6_x_total_total"), "g6_x_total");
    }

    #[test]
    fn detail_mode_changes_are_tracked() {
        let m = fresh();
        assert_eq!(m.detail_mode(), DetailMode::Full);
        m.set_detail_mode(DetailMode::Band, Some(12));
        assert_eq!(m.detail_mode(), DetailMode::Band);
        let (count, cycle, ts) = m.detail_mode_change_meta();
        assert_eq!(count, 1);
        assert_eq!(cycle, Some(12));
        assert!(ts.is_some());
        // Same mode again: no new change recorded.
        m.set_detail_mode(DetailMode::Band, Some(13));
        assert_eq!(m.detail_mode_change_meta().0, 1);
    }

    #[test]
    fn exposition_renders_text() {
        let m = fresh();
        m.inc("collection_cycles", &[]);
        let text = m.render_text();
        assert!(text.contains("g6_collection_cycles_total"));
    }
}
