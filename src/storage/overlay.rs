//! Weekday-overlay master aggregation.
//!
//! Folds per-offset daily CSVs (`data/g6_data/<INDEX>/<TAG>/<OFFSET>/<DATE>.csv`)
//! into per-weekday master files
//! (`data/weekday_master/<INDEX>/<TAG>/<OFFSET>/<WEEKDAY>.csv`) carrying a
//! cumulative mean, an EMA and a single counter per HH:MM:SS timestamp.
//! Re-running the same input at equal values is idempotent for the means
//! and EMAs; the counter still advances.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const WEEKDAY_NAMES_UPPER: [&str; 7] = [
    "MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY", "FRIDAY", "SATURDAY", "SUNDAY",
];

/// Additional per-row option metrics aggregated alongside tp/avg_tp.
pub const METRIC_FIELDS: [&str; 16] = [
    "ce_vol", "pe_vol", "ce_oi", "pe_oi", "ce_iv", "pe_iv", "ce_delta", "pe_delta", "ce_theta",
    "pe_theta", "ce_vega", "pe_vega", "ce_gamma", "pe_gamma", "ce_rho", "pe_rho",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterRecord {
    pub tp_mean: f64,
    pub tp_ema: f64,
    pub avg_tp_mean: f64,
    pub avg_tp_ema: f64,
    /// metric name -> (mean, ema)
    pub metrics: HashMap<String, (f64, f64)>,
    pub counter: u64,
}

impl MasterRecord {
    fn seed(tp: f64, avg_tp: f64, metrics: &HashMap<String, f64>) -> Self {
        let metric_pairs = METRIC_FIELDS
            .iter()
            .map(|name| {
                let v = metrics.get(*name).copied().unwrap_or(0.0);
                (name.to_string(), (v, v))
            })
            .collect();
        Self {
            tp_mean: tp,
            tp_ema: tp,
            avg_tp_mean: avg_tp,
            avg_tp_ema: avg_tp,
            metrics: metric_pairs,
            counter: 1,
        }
    }

    /// Cumulative mean `m += (x-m)/n`; EMA `e = a*x + (1-a)*e`.
    fn update(&mut self, tp: f64, avg_tp: f64, metrics: &HashMap<String, f64>, alpha: f64) {
        self.counter += 1;
        let n = self.counter as f64;
        self.tp_mean += (tp - self.tp_mean) / n;
        self.avg_tp_mean += (avg_tp - self.avg_tp_mean) / n;
        self.tp_ema = alpha * tp + (1.0 - alpha) * self.tp_ema;
        self.avg_tp_ema = alpha * avg_tp + (1.0 - alpha) * self.avg_tp_ema;
        for name in METRIC_FIELDS {
            let slot = self.metrics.entry(name.to_string()).or_insert((0.0, 0.0));
            if let Some(v) = metrics.get(name) {
                slot.0 += (*v - slot.0) / n;
                slot.1 = alpha * *v + (1.0 - alpha) * slot.1;
            }
        }
    }
}

fn parse_time_key(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let tail = raw
        .split_once('T')
        .or_else(|| raw.split_once(' '))
        .map(|(_, t)| t)
        .unwrap_or(raw);
    if tail.len() < 8 {
        return None;
    }
    Some(tail[..8].to_string())
}

fn hhmmss_to_seconds(hms: &str) -> Option<i64> {
    let mut parts = hms.splitn(3, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let s: i64 = parts.next()?.parse().ok()?;
    Some(h * 3600 + m * 60 + s)
}

fn parse_csv_line(header: &[String], line: &str) -> HashMap<String, String> {
    header
        .iter()
        .zip(line.split(','))
        .map(|(k, v)| (k.clone(), v.trim().to_string()))
        .collect()
}

fn field_f64(row: &HashMap<String, String>, key: &str) -> f64 {
    row.get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn field_opt_f64(row: &HashMap<String, String>, key: &str) -> Option<f64> {
    row.get(key)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
}

/// Load an existing master file keyed by HH:MM:SS timestamp.
pub fn load_master_file(path: &Path) -> BTreeMap<String, MasterRecord> {
    let mut out = BTreeMap::new();
    let Ok(body) = std::fs::read_to_string(path) else {
        return out;
    };
    let mut lines = body.lines();
    let Some(header_line) = lines.next() else {
        return out;
    };
    let header: Vec<String> = header_line.split(',').map(|s| s.trim().to_string()).collect();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let row = parse_csv_line(&header, line);
        let Some(ts) = row.get("timestamp").cloned() else {
            continue;
        };
        let mut rec = MasterRecord {
            tp_mean: field_f64(&row, "tp_mean"),
            tp_ema: field_f64(&row, "tp_ema"),
            avg_tp_mean: field_f64(&row, "avg_tp_mean"),
            avg_tp_ema: field_f64(&row, "avg_tp_ema"),
            metrics: HashMap::new(),
            counter: field_f64(&row, "counter") as u64,
        };
        for name in METRIC_FIELDS {
            rec.metrics.insert(
                name.to_string(),
                (
                    field_f64(&row, &format!("{name}_mean")),
                    field_f64(&row, &format!("{name}_ema")),
                ),
            );
        }
        out.insert(ts, rec);
    }
    out
}

/// Atomically write a master file in the canonical column order.
pub fn write_master_file(
    path: &Path,
    index: &str,
    expiry_tag: &str,
    offset: &str,
    data: &BTreeMap<String, MasterRecord>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut header = vec![
        "timestamp".to_string(),
        "tp_mean".to_string(),
        "tp_ema".to_string(),
        "avg_tp_mean".to_string(),
        "avg_tp_ema".to_string(),
    ];
    header.extend(METRIC_FIELDS.iter().map(|n| format!("{n}_mean")));
    header.extend(METRIC_FIELDS.iter().map(|n| format!("{n}_ema")));
    header.extend(["counter", "index", "expiry_tag", "offset"].map(String::from));

    let mut body = header.join(",");
    body.push('\n');
    for (ts, rec) in data {
        let mut cells = vec![
            ts.clone(),
            format!("{:.6}", rec.tp_mean),
            format!("{:.6}", rec.tp_ema),
            format!("{:.6}", rec.avg_tp_mean),
            format!("{:.6}", rec.avg_tp_ema),
        ];
        for name in METRIC_FIELDS {
            let v = rec.metrics.get(name).map(|m| m.0).unwrap_or(0.0);
            cells.push(format!("{v:.6}"));
        }
        for name in METRIC_FIELDS {
            let v = rec.metrics.get(name).map(|m| m.1).unwrap_or(0.0);
            cells.push(format!("{v:.6}"));
        }
        cells.push(rec.counter.to_string());
        cells.push(index.to_string());
        cells.push(expiry_tag.to_string());
        cells.push(offset.to_string());
        body.push_str(&cells.join(","));
        body.push('\n');
    }
    let tmp = path.with_extension("csv.tmp");
    std::fs::write(&tmp, &body).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[derive(Default)]
struct DayAggregate {
    tp: f64,
    avg_tp: f64,
    count: f64,
    metric_sums: HashMap<String, (f64, f64)>, // (sum, n)
}

/// Non-fatal problem observed during an overlay run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverlayIssue {
    pub kind: String,
    pub path: String,
}

/// Per-(index, date) outcome used by the quality report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverlayRunSummary {
    pub index: String,
    pub date: NaiveDate,
    pub updated: usize,
    pub issues: Vec<OverlayIssue>,
}

/// JSON quality report next to the masters; one entry per processed index.
pub fn write_quality_report(
    out_root: &Path,
    date: NaiveDate,
    summaries: &[OverlayRunSummary],
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_root)
        .with_context(|| format!("create {}", out_root.display()))?;
    let path = out_root.join(format!("overlay_quality_{date}.json"));
    let total_issues: usize = summaries.iter().map(|s| s.issues.len()).sum();
    let body = serde_json::to_vec(&serde_json::json!({
        "date": date,
        "total_updated": summaries.iter().map(|s| s.updated).sum::<usize>(),
        "total_issues": total_issues,
        "indices": summaries,
    }))?;
    std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Update weekday masters for one index and trade date. Returns the number
/// of timestamps folded across all (expiry_tag, offset) pairs.
pub fn update_weekday_master(
    base_dir: &Path,
    out_root: &Path,
    index: &str,
    trade_date: NaiveDate,
    alpha: f64,
    market_open: &str,
    market_close: &str,
) -> Result<usize> {
    let mut issues = Vec::new();
    update_weekday_master_with_issues(
        base_dir,
        out_root,
        index,
        trade_date,
        alpha,
        market_open,
        market_close,
        &mut issues,
    )
}

/// Variant collecting non-fatal issues for the quality report.
#[allow(clippy::too_many_arguments)]
pub fn update_weekday_master_with_issues(
    base_dir: &Path,
    out_root: &Path,
    index: &str,
    trade_date: NaiveDate,
    alpha: f64,
    market_open: &str,
    market_close: &str,
    issues: &mut Vec<OverlayIssue>,
) -> Result<usize> {
    let open_s = hhmmss_to_seconds(market_open)
        .filter(|s| *s >= 0)
        .context("invalid market open")?;
    let close_s = hhmmss_to_seconds(market_close)
        .filter(|s| *s > open_s)
        .context("invalid market close")?;
    let weekday = WEEKDAY_NAMES_UPPER[trade_date.weekday().num_days_from_monday() as usize];
    let date_str = trade_date.format("%Y-%m-%d").to_string();

    let index_root = base_dir.join(index);
    if !index_root.is_dir() {
        debug!(index, path = %index_root.display(), "no daily data for index");
        issues.push(OverlayIssue {
            kind: "missing_index_root".to_string(),
            path: index_root.display().to_string(),
        });
        return Ok(0);
    }

    // (expiry_tag, offset) -> ts -> aggregate
    let mut buckets: HashMap<(String, String), BTreeMap<String, DayAggregate>> = HashMap::new();
    for tag_entry in std::fs::read_dir(&index_root)? {
        let tag_dir = tag_entry?.path();
        if !tag_dir.is_dir() {
            continue;
        }
        let expiry_tag = tag_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if expiry_tag == "overview" {
            continue;
        }
        for offset_entry in std::fs::read_dir(&tag_dir)? {
            let offset_dir = offset_entry?.path();
            if !offset_dir.is_dir() {
                continue;
            }
            let offset = offset_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let daily = offset_dir.join(format!("{date_str}.csv"));
            let Ok(body) = std::fs::read_to_string(&daily) else {
                issues.push(OverlayIssue {
                    kind: "missing_daily_csv".to_string(),
                    path: daily.display().to_string(),
                });
                continue;
            };
            let mut lines = body.lines();
            let Some(header_line) = lines.next() else { continue };
            let header: Vec<String> =
                header_line.split(',').map(|s| s.trim().to_string()).collect();
            let slot = buckets
                .entry((expiry_tag.clone(), offset.clone()))
                .or_default();
            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                let row = parse_csv_line(&header, line);
                let Some(ts) = row.get("timestamp").and_then(|t| parse_time_key(t)) else {
                    continue;
                };
                let Some(tsec) = hhmmss_to_seconds(&ts) else { continue };
                if tsec < open_s || tsec > close_s {
                    continue;
                }
                let tp = field_f64(&row, "ce") + field_f64(&row, "pe");
                let avg_tp = field_f64(&row, "avg_ce") + field_f64(&row, "avg_pe");
                let agg = slot.entry(ts).or_default();
                agg.tp += tp;
                agg.avg_tp += avg_tp;
                agg.count += 1.0;
                for name in METRIC_FIELDS {
                    if let Some(v) = field_opt_f64(&row, name) {
                        let m = agg.metric_sums.entry(name.to_string()).or_insert((0.0, 0.0));
                        m.0 += v;
                        m.1 += 1.0;
                    }
                }
            }
        }
    }

    let mut updates = 0usize;
    for ((expiry_tag, offset), ts_map) in buckets {
        if ts_map.is_empty() {
            continue;
        }
        let master_path = out_root
            .join(index)
            .join(&expiry_tag)
            .join(&offset)
            .join(format!("{weekday}.csv"));
        let mut existing = load_master_file(&master_path);
        for (ts, agg) in ts_map {
            let n = agg.count.max(1.0);
            let tp = agg.tp / n;
            let avg_tp = agg.avg_tp / n;
            let per_day: HashMap<String, f64> = agg
                .metric_sums
                .iter()
                .filter(|(_, (_, cnt))| *cnt > 0.0)
                .map(|(name, (sum, cnt))| (name.clone(), sum / cnt))
                .collect();
            match existing.get_mut(&ts) {
                Some(rec) => rec.update(tp, avg_tp, &per_day, alpha),
                None => {
                    existing.insert(ts, MasterRecord::seed(tp, avg_tp, &per_day));
                }
            }
            updates += 1;
        }
        if let Err(e) = write_master_file(&master_path, index, &expiry_tag, &offset, &existing) {
            warn!(error = %e, path = %master_path.display(), "master write failed");
            issues.push(OverlayIssue {
                kind: "master_write_error".to_string(),
                path: master_path.display().to_string(),
            });
        }
    }
    Ok(updates)
}
