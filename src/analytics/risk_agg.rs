//! Risk aggregation builder.
//!
//! Sums option greeks into moneyness buckets per index and expiry, derives
//! delta/vega notionals with a per-index contract multiplier, and reports
//! bucket utilization. Feeds the risk-drift and bucket-utilization guards.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

use super::{bucket_label, parse_bucket_edges, persist_json, DEFAULT_BUCKET_EDGES};
use crate::adaptive::FollowupEngine;
use crate::config::{env_bool, env_f64, env_opt, env_str, env_usize};
use crate::metrics::{unix_now, MetricsRegistry};
use crate::models::OptionSnapshotRow;

#[derive(Debug, Clone)]
pub struct RiskAggConfig {
    pub enabled: bool,
    pub buckets: Vec<f64>,
    pub max_options: usize,
    pub per_index_notionals: bool,
    pub persist: bool,
    pub compress: bool,
    pub persist_dir: String,
}

impl Default for RiskAggConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buckets: parse_bucket_edges(DEFAULT_BUCKET_EDGES, DEFAULT_BUCKET_EDGES),
            max_options: 25_000,
            per_index_notionals: false,
            persist: false,
            compress: false,
            persist_dir: "data/analytics".to_string(),
        }
    }
}

impl RiskAggConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("G6_RISK_AGG", false),
            buckets: parse_bucket_edges(
                &env_str("G6_RISK_AGG_BUCKETS", DEFAULT_BUCKET_EDGES),
                DEFAULT_BUCKET_EDGES,
            ),
            max_options: env_usize("G6_RISK_AGG_MAX_OPTIONS", 25_000),
            per_index_notionals: env_bool("G6_RISK_NOTIONALS_PER_INDEX", false),
            persist: env_bool("G6_RISK_AGG_PERSIST", false),
            compress: env_bool("G6_ANALYTICS_COMPRESS", false),
            persist_dir: env_str("G6_ANALYTICS_DIR", "data/analytics"),
        }
    }
}

/// Contract multiplier for notional scaling, per-index env override first.
pub fn contract_multiplier(index: &str) -> f64 {
    let key = format!("G6_CONTRACT_MULTIPLIER_{}", index.to_ascii_uppercase());
    if let Some(raw) = env_opt(&key) {
        if let Ok(v) = raw.trim().parse::<f64>() {
            return v;
        }
    }
    env_f64("G6_CONTRACT_MULTIPLIER_DEFAULT", 1.0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Notionals {
    pub delta: f64,
    pub vega: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRow {
    pub index: String,
    pub expiry: String,
    pub bucket: String,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
    pub count: usize,
    pub notionals: Notionals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMeta {
    pub version: u32,
    pub builder: String,
    pub buckets: Vec<f64>,
    pub processed: usize,
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPayload {
    pub meta: RiskMeta,
    pub data: Vec<RiskRow>,
}

impl RiskPayload {
    pub fn total_notionals(&self) -> Notionals {
        Notionals {
            delta: self.data.iter().map(|r| r.notionals.delta).sum(),
            vega: self.data.iter().map(|r| r.notionals.vega).sum(),
        }
    }

    /// Populated fraction of the theoretical bucket label universe.
    pub fn bucket_utilization(&self, edges: &[f64]) -> f64 {
        let populated: HashSet<&str> = self.data.iter().map(|r| r.bucket.as_str()).collect();
        let theoretical = edges.len() + 1;
        if theoretical == 0 {
            return 0.0;
        }
        (populated.len() as f64 / theoretical as f64).clamp(0.0, 1.0)
    }
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[derive(Default)]
struct GreekAcc {
    delta: f64,
    gamma: f64,
    vega: f64,
    theta: f64,
    rho: f64,
    count: usize,
}

/// Build the risk aggregation from option snapshot rows. Returns `None`
/// when disabled. Rows missing any greek are skipped.
pub fn build_risk(
    rows_in: &[OptionSnapshotRow],
    cfg: &RiskAggConfig,
    metrics: &MetricsRegistry,
    mut followups: Option<&mut FollowupEngine>,
) -> Option<RiskPayload> {
    if !cfg.enabled {
        return None;
    }
    let start = Instant::now();

    let mut acc: HashMap<(String, String, String), GreekAcc> = HashMap::new();
    let mut processed = 0usize;
    for opt in rows_in {
        if processed >= cfg.max_options {
            break;
        }
        processed += 1;
        if !(opt.underlying > 0.0) {
            continue;
        }
        let (Some(delta), Some(gamma), Some(vega), Some(theta), Some(rho)) =
            (opt.delta, opt.gamma, opt.vega, opt.theta, opt.rho)
        else {
            continue;
        };
        let moneyness_pct = (opt.strike / opt.underlying - 1.0) * 100.0;
        let Some(label) = bucket_label(moneyness_pct, &cfg.buckets) else {
            continue;
        };
        let slot = acc
            .entry((opt.index.clone(), opt.expiry.clone(), label))
            .or_default();
        slot.delta += delta;
        slot.gamma += gamma;
        slot.vega += vega;
        slot.theta += theta;
        slot.rho += rho;
        slot.count += 1;
    }

    let mut rows: Vec<RiskRow> = acc
        .into_iter()
        .map(|((index, expiry, bucket), g)| {
            let mult = contract_multiplier(&index);
            RiskRow {
                notionals: Notionals {
                    delta: round6(g.delta.abs() * mult),
                    vega: round6(g.vega.abs() * mult),
                },
                index,
                expiry,
                bucket,
                delta: round6(g.delta),
                gamma: round6(g.gamma),
                vega: round6(g.vega),
                theta: round6(g.theta),
                rho: round6(g.rho),
                count: g.count,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.index, &a.expiry, &a.bucket).cmp(&(&b.index, &b.expiry, &b.bucket))
    });

    let mut payload = RiskPayload {
        meta: RiskMeta {
            version: 1,
            builder: "basic".to_string(),
            buckets: cfg.buckets.clone(),
            processed,
            persisted: false,
            persist_path: None,
        },
        data: rows,
    };

    let totals = payload.total_notionals();
    let utilization = payload.bucket_utilization(&cfg.buckets);
    metrics.inc("risk_agg_builds", &[]);
    metrics.set("risk_agg_last_build_unixtime", &[], unix_now());
    metrics.observe("risk_agg_build_seconds", &[], start.elapsed().as_secs_f64());
    metrics.set("risk_agg_rows", &[], payload.data.len() as f64);
    metrics.set("risk_agg_notional_delta", &[], round6(totals.delta));
    metrics.set("risk_agg_notional_vega", &[], round6(totals.vega));
    metrics.set("risk_agg_bucket_utilization", &[], utilization);

    if cfg.per_index_notionals {
        let mut per_index: HashMap<&str, Notionals> = HashMap::new();
        for r in &payload.data {
            let slot = per_index.entry(r.index.as_str()).or_default();
            slot.delta += r.notionals.delta;
            slot.vega += r.notionals.vega;
        }
        for (index, n) in per_index {
            metrics.set("risk_agg_notional_delta_index", &[index], round6(n.delta));
            metrics.set("risk_agg_notional_vega_index", &[index], round6(n.vega));
        }
    }

    if let Some(engine) = followups.as_mut() {
        engine.record_risk("global", totals.delta, payload.data.len());
        engine.record_surface("global", None, Some(utilization));
    }

    if cfg.persist {
        match serde_json::to_string(&json!({"meta": &payload.meta, "data": &payload.data})) {
            Ok(body) => match persist_json(&cfg.persist_dir, "risk_agg.latest.json", &body, cfg.compress)
            {
                Ok(path) => {
                    payload.meta.persisted = true;
                    payload.meta.persist_path = Some(path.to_string_lossy().into_owned());
                }
                Err(e) => {
                    debug!(error = %e, "risk agg persistence failed");
                    metrics.inc("persist_errors", &["risk_agg"]);
                }
            },
            Err(e) => debug!(error = %e, "risk agg serialization failed"),
        }
    }

    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;

    fn row(strike: f64, underlying: f64, delta: f64, vega: f64) -> OptionSnapshotRow {
        OptionSnapshotRow {
            index: "NIFTY".to_string(),
            expiry: "2025-09-25".to_string(),
            strike,
            underlying,
            iv: Some(0.2),
            delta: Some(delta),
            gamma: Some(0.001),
            vega: Some(vega),
            theta: Some(-1.2),
            rho: Some(0.5),
        }
    }

    fn metrics() -> MetricsRegistry {
        MetricsRegistry::new(GroupGating::allow_all())
    }

    #[test]
    fn disabled_builder_returns_none() {
        let cfg = RiskAggConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(build_risk(&[], &cfg, &metrics(), None).is_none());
    }

    #[test]
    fn greeks_are_summed_per_bucket() {
        let m = metrics();
        let rows = vec![
            row(20000.0, 20000.0, 0.5, 10.0),
            row(20000.0, 20000.0, -0.4, 8.0),
            row(21500.0, 20000.0, 0.2, 4.0),
        ];
        let payload = build_risk(&rows, &RiskAggConfig::default(), &m, None).unwrap();
        assert_eq!(payload.data.len(), 2);
        let atm = payload.data.iter().find(|r| r.bucket == "[-5,0]").unwrap();
        assert!((atm.delta - 0.1).abs() < 1e-9);
        assert!((atm.vega - 18.0).abs() < 1e-9);
        assert_eq!(atm.count, 2);
        // Notional = |sum| with default multiplier 1.
        assert!((atm.notionals.delta - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rows_missing_any_greek_are_skipped() {
        let m = metrics();
        let mut partial = row(20000.0, 20000.0, 0.5, 10.0);
        partial.theta = None;
        let payload = build_risk(&[partial], &RiskAggConfig::default(), &m, None).unwrap();
        assert!(payload.data.is_empty());
        assert_eq!(payload.meta.processed, 1);
    }

    #[test]
    fn bucket_utilization_is_fraction_of_theoretical() {
        let m = metrics();
        let rows = vec![row(20000.0, 20000.0, 0.5, 10.0)];
        let cfg = RiskAggConfig::default();
        let payload = build_risk(&rows, &cfg, &m, None).unwrap();
        // 7 edges -> 8 theoretical labels, one populated.
        let util = payload.bucket_utilization(&cfg.buckets);
        assert!((util - 1.0 / 8.0).abs() < 1e-9);
        assert_eq!(m.gauge_value("risk_agg_bucket_utilization", &[]), Some(util));
    }

    #[test]
    fn aggregate_gauges_are_exported() {
        let m = metrics();
        let rows = vec![
            row(20000.0, 20000.0, 0.5, 10.0),
            row(21500.0, 20000.0, 0.2, 4.0),
        ];
        build_risk(&rows, &RiskAggConfig::default(), &m, None).unwrap();
        assert_eq!(m.gauge_value("risk_agg_rows", &[]), Some(2.0));
        assert!((m.gauge_value("risk_agg_notional_delta", &[]).unwrap() - 0.7).abs() < 1e-9);
        assert!((m.gauge_value("risk_agg_notional_vega", &[]).unwrap() - 14.0).abs() < 1e-9);
    }

    #[test]
    fn persistence_stamps_meta() {
        let dir = tempfile::tempdir().unwrap();
        let m = metrics();
        let cfg = RiskAggConfig {
            persist: true,
            compress: true,
            persist_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let payload = build_risk(&[row(20000.0, 20000.0, 0.5, 10.0)], &cfg, &m, None).unwrap();
        assert!(payload.meta.persisted);
        let path = payload.meta.persist_path.unwrap();
        assert!(path.ends_with(".json.gz"));
        assert!(std::path::Path::new(&path).exists());
    }
}
