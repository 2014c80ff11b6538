//! Declarative metric catalog.
//!
//! Every statically-known metric is described by a [`MetricDef`] and
//! registered by walking [`metric_specs`]. Dynamic metrics (per-expiry
//! surface variants, per-index notionals, the event-bus family) go through
//! `MetricsRegistry::maybe_register` at their call sites.

use crate::config::env_bool;
use crate::metrics::gating::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    /// Registered as a histogram; quantile summaries are not exposed by the
    /// underlying client, percentiles come from histogram buckets.
    Summary,
}

#[derive(Clone)]
pub struct MetricDef {
    /// Attribute key used for lookups (`metrics.inc("...")`).
    pub attr: &'static str,
    /// Fully-qualified exposition name.
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
    /// Gating group; `None` means core/ungated.
    pub group: Option<&'static str>,
    /// Extra registration predicate evaluated at walk time.
    pub predicate: Option<fn() -> bool>,
}

const fn def(
    attr: &'static str,
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
    labels: &'static [&'static str],
    group: Option<&'static str>,
) -> MetricDef {
    MetricDef {
        attr,
        name,
        help,
        kind,
        labels,
        group,
        predicate: None,
    }
}

fn per_index_notionals_enabled() -> bool {
    env_bool("G6_RISK_NOTIONALS_PER_INDEX", false)
}

/// The static catalog. Order matters only for readability; the registry
/// walk is order-independent.
pub fn metric_specs() -> Vec<MetricDef> {
    let mut specs = vec![
        // --- cycle / orchestrator core -------------------------------------
        def(
            "collection_cycles",
            "g6_collection_cycles_total",
            "Completed collection cycles",
            MetricKind::Counter,
            &[],
            None,
        ),
        def(
            "collection_cycle_seconds",
            "g6_collection_cycle_seconds",
            "Wall-clock duration of a full collection cycle",
            MetricKind::Histogram,
            &[],
            None,
        ),
        def(
            "cycles_per_hour",
            "g6_cycles_per_hour",
            "Observed cycle cadence extrapolated to one hour",
            MetricKind::Gauge,
            &[],
            None,
        ),
        def(
            "options_per_minute",
            "g6_options_per_minute",
            "Option rows processed per minute (last cycle extrapolation)",
            MetricKind::Gauge,
            &[],
            None,
        ),
        def(
            "cycle_success_rate",
            "g6_cycle_success_rate_pct",
            "Percentage of cycles completing without index failures",
            MetricKind::Gauge,
            &[],
            None,
        ),
        def(
            "api_success_rate",
            "g6_api_success_rate_pct",
            "Provider call success percentage (EMA)",
            MetricKind::Gauge,
            &[],
            None,
        ),
        def(
            "index_price",
            "g6_index_price",
            "Last observed index price",
            MetricKind::Gauge,
            &["index"],
            None,
        ),
        def(
            "index_atm",
            "g6_index_atm_strike",
            "ATM strike used for the last cycle",
            MetricKind::Gauge,
            &["index"],
            None,
        ),
        def(
            "index_options_processed",
            "g6_index_options_processed_total",
            "Option rows processed per index",
            MetricKind::Counter,
            &["index"],
            None,
        ),
        def(
            "index_errors",
            "g6_index_errors_total",
            "Per-index collection errors by kind",
            MetricKind::Counter,
            &["index", "reason"],
            None,
        ),
        def(
            "option_filter_rejects",
            "g6_option_filter_rejects_total",
            "Instrument rows rejected by the option filter",
            MetricKind::Counter,
            &["index", "reason"],
            None,
        ),
        def(
            "instrument_coverage_pct",
            "g6_instrument_coverage_pct",
            "Requested-strike coverage per expiry (percent)",
            MetricKind::Gauge,
            &["index", "expiry"],
            None,
        ),
        def(
            "field_coverage_pct",
            "g6_option_field_coverage_pct",
            "Full-field (volume+oi+avg_price) coverage per expiry (percent)",
            MetricKind::Gauge,
            &["index", "expiry"],
            None,
        ),
        def(
            "missing_option_fields",
            "g6_missing_option_fields_total",
            "Option rows missing a field, by field",
            MetricKind::Counter,
            &["index", "expiry", "field"],
            None,
        ),
        def(
            "runtime_status_writes",
            "g6_runtime_status_writes_total",
            "Runtime status snapshot writes",
            MetricKind::Counter,
            &[],
            None,
        ),
        def(
            "runtime_status_last_write_unixtime",
            "g6_runtime_status_last_write_unixtime",
            "Unix timestamp of the last runtime status write",
            MetricKind::Gauge,
            &[],
            None,
        ),
        def(
            "benchmark_writes",
            "g6_benchmark_writes_total",
            "Benchmark cycle artifacts written",
            MetricKind::Counter,
            &[],
            None,
        ),
        def(
            "benchmark_anomalies",
            "g6_benchmark_anomalies_total",
            "Benchmark series anomalies flagged",
            MetricKind::Counter,
            &["series"],
            None,
        ),
        // --- provider (ALWAYS_ON group) ------------------------------------
        def(
            "provider_calls",
            "g6_provider_calls_total",
            "Provider adapter calls by operation and outcome",
            MetricKind::Counter,
            &["op", "outcome"],
            Some(GROUP_PROVIDER_FAILOVER),
        ),
        def(
            "provider_synthetic_quotes",
            "g6_provider_synthetic_quotes_total",
            "Zero-price synthetic quotes injected after empty enrichment",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_PROVIDER_FAILOVER),
        ),
        // --- expiry remediation (ALWAYS_ON group) --------------------------
        def(
            "expiry_fallback",
            "g6_expiry_fallback_total",
            "Expiry fallback applications by kind",
            MetricKind::Counter,
            &["index", "kind"],
            Some(GROUP_EXPIRY_REMEDIATION),
        ),
        // --- sla / health (ALWAYS_ON group) --------------------------------
        def(
            "cycle_sla_breach",
            "g6_cycle_sla_breach_total",
            "Cycles exceeding the configured interval",
            MetricKind::Counter,
            &[],
            Some(GROUP_SLA_HEALTH),
        ),
        def(
            "component_health",
            "g6_component_health",
            "Component health (1 healthy, 0 otherwise)",
            MetricKind::Gauge,
            &["component"],
            Some(GROUP_SLA_HEALTH),
        ),
        // --- iv estimation (ALWAYS_ON group) -------------------------------
        def(
            "iv_estimations",
            "g6_iv_estimations_total",
            "Successful implied-volatility solves",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_IV_ESTIMATION),
        ),
        def(
            "iv_iterations",
            "g6_iv_solver_iterations",
            "Newton-Raphson iterations used per solve",
            MetricKind::Histogram,
            &[],
            Some(GROUP_IV_ESTIMATION),
        ),
        def(
            "iv_fail",
            "g6_iv_estimation_failures_total",
            "Implied-volatility solves abandoned",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_IV_ESTIMATION),
        ),
        // --- greeks --------------------------------------------------------
        def(
            "greeks_computed",
            "g6_greeks_computed_total",
            "Options with greeks computed",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_GREEKS),
        ),
        def(
            "greeks_fail",
            "g6_greeks_failures_total",
            "Greek computations skipped on invalid inputs",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_GREEKS),
        ),
        // --- vol surface ---------------------------------------------------
        def(
            "vol_surface_builds",
            "g6_vol_surface_builds_total",
            "Volatility surface builds",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_build_seconds",
            "g6_vol_surface_build_seconds",
            "Volatility surface build duration",
            MetricKind::Histogram,
            &[],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_interp_seconds",
            "g6_vol_surface_interp_seconds",
            "Volatility surface interpolation duration",
            MetricKind::Histogram,
            &[],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_rows",
            "g6_vol_surface_rows",
            "Vol surface row count by source",
            MetricKind::Gauge,
            &["index", "source"],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_interpolated_fraction",
            "g6_vol_surface_interpolated_fraction",
            "Fraction of surface rows that are interpolated",
            MetricKind::Gauge,
            &["index"],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_quality_score",
            "g6_vol_surface_quality_score",
            "Surface quality heuristic: coverage x (1 - interp fraction)",
            MetricKind::Gauge,
            &["index"],
            Some(GROUP_VOL_SURFACE),
        ),
        def(
            "vol_surface_last_build_unixtime",
            "g6_vol_surface_last_build_unixtime",
            "Unix timestamp of the last surface build",
            MetricKind::Gauge,
            &["index"],
            Some(GROUP_VOL_SURFACE),
        ),
        // --- risk aggregation ----------------------------------------------
        def(
            "risk_agg_builds",
            "g6_risk_agg_builds_total",
            "Risk aggregation builds",
            MetricKind::Counter,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_build_seconds",
            "g6_risk_agg_build_seconds",
            "Risk aggregation build duration",
            MetricKind::Histogram,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_rows",
            "g6_risk_agg_rows",
            "Risk aggregation row count",
            MetricKind::Gauge,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_notional_delta",
            "g6_risk_agg_notional_delta",
            "Aggregate delta notional",
            MetricKind::Gauge,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_notional_vega",
            "g6_risk_agg_notional_vega",
            "Aggregate vega notional",
            MetricKind::Gauge,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_bucket_utilization",
            "g6_risk_agg_bucket_utilization",
            "Populated fraction of theoretical moneyness buckets",
            MetricKind::Gauge,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        def(
            "risk_agg_last_build_unixtime",
            "g6_risk_agg_last_build_unixtime",
            "Unix timestamp of the last risk build",
            MetricKind::Gauge,
            &[],
            Some(GROUP_RISK_AGG),
        ),
        // --- adaptive controller -------------------------------------------
        def(
            "adaptive_interpolation_alerts",
            "g6_adaptive_interpolation_alerts_total",
            "Interpolation-high alerts emitted",
            MetricKind::Counter,
            &["index", "reason"],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_interpolation_streak",
            "g6_adaptive_interpolation_streak",
            "Current consecutive above-threshold interpolation builds",
            MetricKind::Gauge,
            &["index"],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_risk_delta_drift_alerts",
            "g6_adaptive_risk_delta_drift_alerts_total",
            "Risk delta drift alerts by direction",
            MetricKind::Counter,
            &["direction"],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_risk_delta_last_change_pct",
            "g6_adaptive_risk_delta_last_change_pct",
            "Absolute delta-notional change percent across the drift window",
            MetricKind::Gauge,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_bucket_util_alerts",
            "g6_adaptive_bucket_util_alerts_total",
            "Bucket utilization low alerts emitted",
            MetricKind::Counter,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_bucket_util_streak",
            "g6_adaptive_bucket_util_streak",
            "Current consecutive below-threshold utilization builds",
            MetricKind::Gauge,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_transitions",
            "g6_adaptive_transitions_total",
            "Adaptive degrade controller state transitions",
            MetricKind::Counter,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "adaptive_backlog_ratio",
            "g6_adaptive_backlog_ratio",
            "Event backlog as a fraction of capacity",
            MetricKind::Gauge,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "option_detail_mode",
            "g6_option_detail_mode",
            "Adaptive detail mode (0 full, 1 band, 2 agg)",
            MetricKind::Gauge,
            &[],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        def(
            "option_detail_band_rejections",
            "g6_option_detail_band_rejections_total",
            "Per-option emissions rejected by the band window",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_ADAPTIVE_CONTROLLER),
        ),
        // --- follow-ups ----------------------------------------------------
        def(
            "followups_interp_guard",
            "g6_followups_interp_guard_total",
            "Interpolation guard triggers",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_ADAPTIVE_FOLLOWUPS),
        ),
        def(
            "followups_risk_drift",
            "g6_followups_risk_drift_total",
            "Risk exposure drift triggers",
            MetricKind::Counter,
            &["index", "sign"],
            Some(GROUP_ADAPTIVE_FOLLOWUPS),
        ),
        def(
            "followups_bucket_coverage",
            "g6_followups_bucket_coverage_total",
            "Bucket coverage low triggers",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_ADAPTIVE_FOLLOWUPS),
        ),
        def(
            "followups_last_state",
            "g6_followups_last_state",
            "Last measured follow-up state value by type",
            MetricKind::Gauge,
            &["index", "type"],
            Some(GROUP_ADAPTIVE_FOLLOWUPS),
        ),
        def(
            "followups_weight_pressure",
            "g6_followups_weight_pressure",
            "Rolling accumulated weight for follow-up alerts",
            MetricKind::Gauge,
            &[],
            Some(GROUP_ADAPTIVE_FOLLOWUPS),
        ),
        // --- cardinality sampling ------------------------------------------
        def(
            "metric_sampling_events",
            "g6_metric_sampling_events_total",
            "Cardinality manager decisions",
            MetricKind::Counter,
            &["category", "decision", "reason"],
            Some(GROUP_CARDINALITY),
        ),
        def(
            "metric_sampling_rate_limit_per_sec",
            "g6_metric_sampling_rate_limit_per_sec",
            "Configured per-second emission budget",
            MetricKind::Gauge,
            &["category"],
            Some(GROUP_CARDINALITY),
        ),
        // --- caches --------------------------------------------------------
        def(
            "root_cache_hits",
            "g6_root_cache_hits_total",
            "Root detection cache hits",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "root_cache_misses",
            "g6_root_cache_misses_total",
            "Root detection cache misses",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "root_cache_evictions",
            "g6_root_cache_evictions_total",
            "Root detection cache evictions",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "root_cache_size",
            "g6_root_cache_size",
            "Root detection cache entry count",
            MetricKind::Gauge,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "root_cache_hit_ratio",
            "g6_root_cache_hit_ratio",
            "Root detection cache hit ratio (0-1)",
            MetricKind::Gauge,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "serial_cache_hits",
            "g6_serial_cache_hits_total",
            "Serialization cache hits",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "serial_cache_misses",
            "g6_serial_cache_misses_total",
            "Serialization cache misses",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "serial_cache_evictions",
            "g6_serial_cache_evictions_total",
            "Serialization cache evictions",
            MetricKind::Counter,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "serial_cache_size",
            "g6_serial_cache_size",
            "Serialization cache entry count",
            MetricKind::Gauge,
            &[],
            Some(GROUP_CACHE),
        ),
        def(
            "serial_cache_hit_ratio",
            "g6_serial_cache_hit_ratio",
            "Serialization cache hit ratio (0-1)",
            MetricKind::Gauge,
            &[],
            Some(GROUP_CACHE),
        ),
        // --- panel diffs ---------------------------------------------------
        def(
            "panel_diff_writes",
            "g6_panel_diff_writes_total",
            "Panel artifacts written by type",
            MetricKind::Counter,
            &["type"],
            Some(GROUP_PANEL_DIFF),
        ),
        def(
            "panel_diff_truncated",
            "g6_panel_diff_truncated_total",
            "Panel diffs truncated at the nesting depth bound",
            MetricKind::Counter,
            &[],
            Some(GROUP_PANEL_DIFF),
        ),
        def(
            "panel_diff_last_bytes",
            "g6_panel_diff_last_bytes",
            "Serialized size of the last panel diff",
            MetricKind::Gauge,
            &[],
            Some(GROUP_PANEL_DIFF),
        ),
        // --- storage -------------------------------------------------------
        def(
            "csv_records_written",
            "g6_csv_records_written_total",
            "Option rows written to CSV sinks",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_STORAGE),
        ),
        def(
            "overview_writes",
            "g6_overview_writes_total",
            "Overview snapshots written",
            MetricKind::Counter,
            &["index"],
            Some(GROUP_STORAGE),
        ),
        def(
            "persist_errors",
            "g6_persist_errors_total",
            "Persistence failures by component",
            MetricKind::Counter,
            &["component"],
            Some(GROUP_STORAGE),
        ),
    ];

    // Optional per-index notional gauges, flag-gated like the builder path.
    specs.push(MetricDef {
        attr: "risk_agg_notional_delta_index",
        name: "g6_risk_agg_notional_delta_index",
        help: "Aggregate delta notional per index",
        kind: MetricKind::Gauge,
        labels: &["index"],
        group: Some(GROUP_RISK_AGG),
        predicate: Some(per_index_notionals_enabled),
    });
    specs.push(MetricDef {
        attr: "risk_agg_notional_vega_index",
        name: "g6_risk_agg_notional_vega_index",
        help: "Aggregate vega notional per index",
        kind: MetricKind::Gauge,
        labels: &["index"],
        group: Some(GROUP_RISK_AGG),
        predicate: Some(per_index_notionals_enabled),
    });

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn attrs_and_names_are_unique() {
        let specs = metric_specs();
        let attrs: HashSet<_> = specs.iter().map(|s| s.attr).collect();
        let names: HashSet<_> = specs.iter().map(|s| s.name).collect();
        assert_eq!(attrs.len(), specs.len());
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn counters_end_with_total() {
        for spec in metric_specs() {
            if spec.kind == MetricKind::Counter {
                assert!(
                    spec.name.ends_with("_total"),
                    "counter {} must end with _total",
                    spec.name
                );
            } else {
                assert!(
                    !spec.name.ends_with("_total"),
                    "non-counter {} must not end with _total",
                    spec.name
                );
            }
        }
    }

    #[test]
    fn all_names_carry_prefix() {
        for spec in metric_specs() {
            assert!(spec.name.starts_with("g6_"), "{} missing prefix", spec.name);
        }
    }

    #[test]
    fn groups_are_known() {
        let known = crate::metrics::gating::controlled_groups();
        for spec in metric_specs() {
            if let Some(g) = spec.group {
                assert!(known.contains(g), "unknown group {g} on {}", spec.attr);
            }
        }
    }
}
