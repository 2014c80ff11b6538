//! Volatility surface builder.
//!
//! Aggregates option snapshots into a coarse surface organized by index,
//! expiry and moneyness bucket, with optional linear interpolation of
//! missing internal buckets (never extrapolated) and JSON persistence.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use super::{
    bucket_label, bucket_midpoint, finite_bucket_labels, parse_bucket_edges, persist_json,
    DEFAULT_BUCKET_EDGES,
};
use crate::adaptive::FollowupEngine;
use crate::config::{env_bool, env_str, env_usize};
use crate::metrics::{unix_now, MetricsRegistry};
use crate::models::OptionSnapshotRow;

#[derive(Debug, Clone)]
pub struct VolSurfaceConfig {
    pub enabled: bool,
    pub buckets: Vec<f64>,
    pub max_options: usize,
    pub interpolate: bool,
    pub per_expiry_metrics: bool,
    pub persist: bool,
    pub compress: bool,
    pub persist_dir: String,
}

impl Default for VolSurfaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buckets: parse_bucket_edges(DEFAULT_BUCKET_EDGES, DEFAULT_BUCKET_EDGES),
            max_options: 20_000,
            interpolate: false,
            per_expiry_metrics: false,
            persist: false,
            compress: false,
            persist_dir: "data/analytics".to_string(),
        }
    }
}

impl VolSurfaceConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("G6_VOL_SURFACE", false),
            buckets: parse_bucket_edges(
                &env_str("G6_VOL_SURFACE_BUCKETS", DEFAULT_BUCKET_EDGES),
                DEFAULT_BUCKET_EDGES,
            ),
            max_options: env_usize("G6_VOL_SURFACE_MAX_OPTIONS", 20_000),
            interpolate: env_bool("G6_VOL_SURFACE_INTERPOLATE", false),
            per_expiry_metrics: env_bool("G6_VOL_SURFACE_PER_EXPIRY", false),
            persist: env_bool("G6_VOL_SURFACE_PERSIST", false),
            compress: env_bool("G6_ANALYTICS_COMPRESS", false),
            persist_dir: env_str("G6_ANALYTICS_DIR", "data/analytics"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfaceRow {
    pub index: String,
    pub expiry: String,
    pub bucket: String,
    pub avg_iv: f64,
    pub count: usize,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceMeta {
    pub version: u32,
    pub builder: String,
    pub buckets: Vec<f64>,
    pub processed: usize,
    pub interpolated: bool,
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfacePayload {
    pub meta: SurfaceMeta,
    pub data: Vec<SurfaceRow>,
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Build the surface from option snapshot rows. Returns `None` when the
/// builder is disabled. Feeds the interpolated fraction into the follow-up
/// guards when an engine is supplied.
pub fn build_surface(
    rows_in: &[OptionSnapshotRow],
    cfg: &VolSurfaceConfig,
    metrics: &MetricsRegistry,
    mut followups: Option<&mut FollowupEngine>,
) -> Option<SurfacePayload> {
    if !cfg.enabled {
        return None;
    }
    let start = Instant::now();

    // (index, expiry, bucket) -> accumulated ivs
    let mut acc: HashMap<(String, String, String), Vec<f64>> = HashMap::new();
    let mut processed = 0usize;
    for opt in rows_in {
        if processed >= cfg.max_options {
            break;
        }
        processed += 1;
        let Some(iv) = opt.iv else { continue };
        if !(opt.underlying > 0.0) {
            continue;
        }
        let moneyness_pct = (opt.strike / opt.underlying - 1.0) * 100.0;
        let Some(label) = bucket_label(moneyness_pct, &cfg.buckets) else {
            continue;
        };
        acc.entry((opt.index.clone(), opt.expiry.clone(), label))
            .or_default()
            .push(iv);
    }

    let mut rows: Vec<SurfaceRow> = acc
        .into_iter()
        .filter(|(_, ivs)| !ivs.is_empty())
        .map(|((index, expiry, bucket), ivs)| SurfaceRow {
            index,
            expiry,
            bucket,
            avg_iv: round6(ivs.iter().sum::<f64>() / ivs.len() as f64),
            count: ivs.len(),
            source: "raw".to_string(),
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.index, &a.expiry, &a.bucket).cmp(&(&b.index, &b.expiry, &b.bucket))
    });

    let mut interp_elapsed = 0.0;
    if cfg.interpolate {
        let interp_start = Instant::now();
        interpolate_missing(&mut rows, &cfg.buckets);
        interp_elapsed = interp_start.elapsed().as_secs_f64();
    }

    let mut payload = SurfacePayload {
        meta: SurfaceMeta {
            version: 1,
            builder: "basic".to_string(),
            buckets: cfg.buckets.clone(),
            processed,
            interpolated: cfg.interpolate,
            persisted: false,
            persist_path: None,
        },
        data: rows,
    };

    emit_metrics(&payload, cfg, metrics, start.elapsed().as_secs_f64(), interp_elapsed);

    let raw_count = payload.data.iter().filter(|r| r.source == "raw").count();
    let interp_count = payload.data.len() - raw_count;
    let total = raw_count + interp_count;
    let frac = if total > 0 {
        interp_count as f64 / total as f64
    } else {
        0.0
    };
    if let Some(engine) = followups.as_mut() {
        engine.record_surface("global", Some(frac), None);
    }

    if cfg.persist {
        match serde_json::to_string(&json!({"meta": &payload.meta, "data": &payload.data})) {
            Ok(body) => match persist_json(&cfg.persist_dir, "vol_surface.latest.json", &body, cfg.compress) {
                Ok(path) => {
                    payload.meta.persisted = true;
                    payload.meta.persist_path = Some(path.to_string_lossy().into_owned());
                }
                Err(e) => {
                    debug!(error = %e, "vol surface persistence failed");
                    metrics.inc("persist_errors", &["vol_surface"]);
                }
            },
            Err(e) => debug!(error = %e, "vol surface serialization failed"),
        }
    }

    Some(payload)
}

/// Fill missing internal buckets per (index, expiry) by linear interpolation
/// between the nearest known anchors. At least two raw anchors are required;
/// no extrapolation beyond the first/last known bucket.
fn interpolate_missing(rows: &mut Vec<SurfaceRow>, edges: &[f64]) {
    let finite = finite_bucket_labels(edges);
    let mut by_key: HashMap<(String, String), HashMap<String, f64>> = HashMap::new();
    for r in rows.iter() {
        if r.source == "interp" {
            continue;
        }
        by_key
            .entry((r.index.clone(), r.expiry.clone()))
            .or_default()
            .insert(r.bucket.clone(), r.avg_iv);
    }
    for ((index, expiry), bucket_map) in by_key {
        let existing: Vec<(f64, f64)> = finite
            .iter()
            .filter_map(|lbl| {
                let iv = bucket_map.get(lbl)?;
                Some((bucket_midpoint(lbl)?, *iv))
            })
            .collect();
        if existing.len() < 2 {
            continue;
        }
        for span in existing.windows(2) {
            let (left_mid, left_iv) = span[0];
            let (right_mid, right_iv) = span[1];
            let width = right_mid - left_mid;
            if width == 0.0 {
                continue;
            }
            for lbl in &finite {
                if bucket_map.contains_key(lbl) {
                    continue;
                }
                let Some(mid) = bucket_midpoint(lbl) else { continue };
                if left_mid < mid && mid < right_mid {
                    let t = (mid - left_mid) / width;
                    rows.push(SurfaceRow {
                        index: index.clone(),
                        expiry: expiry.clone(),
                        bucket: lbl.clone(),
                        avg_iv: round6(left_iv + t * (right_iv - left_iv)),
                        count: 0,
                        source: "interp".to_string(),
                    });
                }
            }
        }
    }
}

fn emit_metrics(
    payload: &SurfacePayload,
    cfg: &VolSurfaceConfig,
    metrics: &MetricsRegistry,
    elapsed: f64,
    interp_elapsed: f64,
) {
    metrics.inc("vol_surface_builds", &["global"]);
    metrics.set("vol_surface_last_build_unixtime", &["global"], unix_now());
    metrics.observe("vol_surface_build_seconds", &[], elapsed);
    if interp_elapsed > 0.0 {
        metrics.observe("vol_surface_interp_seconds", &[], interp_elapsed);
    }
    let raw_count = payload.data.iter().filter(|r| r.source == "raw").count();
    let interp_count = payload.data.len() - raw_count;
    metrics.set("vol_surface_rows", &["global", "raw"], raw_count as f64);
    metrics.set("vol_surface_rows", &["global", "interp"], interp_count as f64);
    let total = raw_count + interp_count;
    let frac = if total > 0 {
        interp_count as f64 / total as f64
    } else {
        0.0
    };
    metrics.set("vol_surface_interpolated_fraction", &["global"], frac);
    let coverage = if total > 0 {
        raw_count as f64 / total as f64
    } else {
        0.0
    };
    metrics.set("vol_surface_quality_score", &["global"], coverage * (1.0 - frac));

    if cfg.per_expiry_metrics {
        use crate::metrics::gating::GROUP_VOL_SURFACE;
        use crate::metrics::spec::MetricKind;
        let _ = metrics.maybe_register(
            GROUP_VOL_SURFACE,
            "vol_surface_rows_expiry",
            MetricKind::Gauge,
            "g6_vol_surface_rows_expiry",
            "Vol surface per-expiry row count by source",
            &["index", "expiry", "source"],
        );
        let _ = metrics.maybe_register(
            GROUP_VOL_SURFACE,
            "vol_surface_interpolated_fraction_expiry",
            MetricKind::Gauge,
            "g6_vol_surface_interpolated_fraction_expiry",
            "Fraction interpolated per expiry",
            &["index", "expiry"],
        );
        let mut per_expiry: HashMap<&str, (usize, usize)> = HashMap::new();
        for r in &payload.data {
            let slot = per_expiry.entry(r.expiry.as_str()).or_insert((0, 0));
            if r.source == "raw" {
                slot.0 += 1;
            } else {
                slot.1 += 1;
            }
        }
        for (expiry, (raw, interp)) in per_expiry {
            metrics.set("vol_surface_rows_expiry", &["global", expiry, "raw"], raw as f64);
            metrics.set(
                "vol_surface_rows_expiry",
                &["global", expiry, "interp"],
                interp as f64,
            );
            let tot = raw + interp;
            let frac_e = if tot > 0 { interp as f64 / tot as f64 } else { 0.0 };
            metrics.set(
                "vol_surface_interpolated_fraction_expiry",
                &["global", expiry],
                frac_e,
            );
        }
    }
}
