//! Benchmark cycle artifact.
//!
//! Assembles a per-cycle summary (phase timings, per-index expiry statuses,
//! option totals), optionally annotates robust-zscore anomalies against the
//! recent artifact history, stamps a canonical-JSON SHA-256 digest, writes
//! `benchmark_cycle_<UTC_ISO_us>.json[.gz]` and prunes to `keep_n` files.
//! Best-effort throughout: a failed write never disturbs the cycle.

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{env_bool, env_f64, env_usize};
use crate::events::serialization::canonical_json;
use crate::metrics::MetricsRegistry;
use crate::models::CycleStatus;

/// Robust z-scores via median/MAD. Returns (flags, scores); series shorter
/// than `min_points` yield all-false flags.
pub fn detect_anomalies(series: &[f64], threshold: f64, min_points: usize) -> (Vec<bool>, Vec<f64>) {
    let n = series.len();
    if n < min_points.max(1) {
        return (vec![false; n], vec![0.0; n]);
    }
    let mut sorted: Vec<f64> = series.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = sorted[n / 2];
    let mut deviations: Vec<f64> = series.iter().map(|x| (x - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mad = deviations[n / 2];
    if mad == 0.0 {
        let flags = series.iter().map(|x| *x != median).collect();
        let scores = series
            .iter()
            .map(|x| if *x == median { 0.0 } else { f64::INFINITY })
            .collect();
        return (flags, scores);
    }
    let scores: Vec<f64> = series
        .iter()
        .map(|x| 0.6745 * (x - median) / mad)
        .collect();
    let flags = scores.iter().map(|s| s.abs() >= threshold).collect();
    (flags, scores)
}

pub struct BenchmarkWriter {
    pub dump_dir: PathBuf,
    pub compress: bool,
    pub keep_n: usize,
}

impl BenchmarkWriter {
    pub fn new(dump_dir: impl AsRef<Path>, compress: bool, keep_n: usize) -> Self {
        Self {
            dump_dir: dump_dir.as_ref().to_path_buf(),
            compress,
            keep_n: keep_n.max(1),
        }
    }

    /// Assemble and persist the artifact. Returns the written path.
    pub fn write_artifact(
        &self,
        indices: &[CycleStatus],
        total_elapsed: f64,
        phase_times: &BTreeMap<String, f64>,
        phase_failures: &BTreeMap<String, u64>,
        metrics: &MetricsRegistry,
    ) -> Result<PathBuf> {
        let mut payload = make_payload(indices, total_elapsed, phase_times, phase_failures);
        if env_bool("G6_BENCHMARK_ANNOTATE_OUTLIERS", false) {
            self.annotate_anomalies(&mut payload, metrics);
        }
        let digest = hex::encode(Sha256::digest(canonical_json(&payload).as_bytes()));
        payload["digest_sha256"] = json!(digest);

        std::fs::create_dir_all(&self.dump_dir)
            .with_context(|| format!("create {}", self.dump_dir.display()))?;
        let ts = Utc::now().format("%Y%m%dT%H%M%S%fZ");
        let mut path = self.dump_dir.join(format!("benchmark_cycle_{ts}.json"));
        if self.compress {
            path = self.dump_dir.join(format!("benchmark_cycle_{ts}.json.gz"));
        }
        let body = serde_json::to_vec(&payload)?;
        if self.compress {
            let file = std::fs::File::create(&path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()?;
        } else {
            std::fs::write(&path, &body)?;
        }
        metrics.inc("benchmark_writes", &[]);
        self.prune();
        Ok(path)
    }

    fn artifact_paths(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dump_dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("benchmark_cycle_"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths
    }

    fn prune(&self) {
        let paths = self.artifact_paths();
        if paths.len() <= self.keep_n {
            return;
        }
        let excess = paths.len() - self.keep_n;
        for victim in paths.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&victim) {
                debug!(path = %victim.display(), error = %e, "benchmark prune failed");
            }
        }
    }

    fn annotate_anomalies(&self, payload: &mut Value, metrics: &MetricsRegistry) {
        let history_limit = env_usize("G6_BENCHMARK_ANOMALY_HISTORY", 60);
        let threshold = env_f64("G6_BENCHMARK_ANOMALY_THRESHOLD", 3.5);
        let mut options_series = Vec::new();
        let mut duration_series = Vec::new();
        let paths = self.artifact_paths();
        let start = paths.len().saturating_sub(history_limit);
        for path in &paths[start..] {
            let Some(prev) = read_artifact(path) else { continue };
            if let Some(v) = prev.get("options_total").and_then(Value::as_f64) {
                options_series.push(v);
            }
            if let Some(v) = prev.get("duration_s").and_then(Value::as_f64) {
                duration_series.push(v);
            }
        }
        options_series.push(
            payload
                .get("options_total")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        );
        duration_series.push(
            payload
                .get("duration_s")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        );

        let mut anomalies = serde_json::Map::new();
        let mut active_flags = 0u32;
        let mut max_severity = 0.0f64;
        for (series_name, series) in [
            ("options_total", &options_series),
            ("duration_s", &duration_series),
        ] {
            let (flags, scores) = detect_anomalies(series, threshold, 5);
            let (Some(flag), Some(score)) = (flags.last(), scores.last()) else {
                continue;
            };
            anomalies.insert(
                series_name.to_string(),
                json!({
                    "is_anomaly": flag,
                    "score": if score.is_finite() { json!(score) } else { json!(null) },
                    "threshold": threshold,
                    "history": series.len() - 1,
                }),
            );
            if *flag {
                active_flags += 1;
                metrics.inc("benchmark_anomalies", &[series_name]);
            }
            if score.is_finite() {
                max_severity = max_severity.max(score.abs());
            }
        }
        if !anomalies.is_empty() {
            payload["anomalies"] = Value::Object(anomalies);
            payload["anomaly_summary"] = json!({
                "active_flags": active_flags,
                "max_severity": max_severity,
            });
        }
    }
}

fn make_payload(
    indices: &[CycleStatus],
    total_elapsed: f64,
    phase_times: &BTreeMap<String, f64>,
    phase_failures: &BTreeMap<String, u64>,
) -> Value {
    let options_total: usize = indices
        .iter()
        .flat_map(|ix| ix.expiries.iter())
        .map(|ex| ex.options)
        .sum();
    let mut partial_reason_totals: BTreeMap<&'static str, u64> = BTreeMap::new();
    for ex in indices.iter().flat_map(|ix| ix.expiries.iter()) {
        if let Some(reason) = ex.partial_reason {
            *partial_reason_totals.entry(reason.as_str()).or_insert(0) += 1;
        }
    }
    json!({
        "version": 1,
        "timestamp": Utc::now().format("%Y%m%dT%H%M%S%fZ").to_string(),
        "duration_s": total_elapsed,
        "phase_times": phase_times,
        "phase_failures": phase_failures,
        "options_total": options_total,
        "indices": indices
            .iter()
            .map(|ix| {
                json!({
                    "index": ix.index,
                    "status": ix.status.as_str(),
                    "expiries": ix
                        .expiries
                        .iter()
                        .map(|ex| {
                            json!({
                                "rule": ex.rule.as_str(),
                                "status": ex.status.as_str(),
                                "options": ex.options,
                                "strike_coverage": ex.strike_coverage,
                                "field_coverage": ex.field_coverage,
                                "partial_reason": ex.partial_reason.map(|r| r.as_str()),
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>(),
        "partial_reason_totals": partial_reason_totals,
    })
}

fn read_artifact(path: &Path) -> Option<Value> {
    let name = path.file_name()?.to_str()?;
    let body = if name.ends_with(".gz") {
        let file = std::fs::File::open(path).ok()?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut out = String::new();
        decoder.read_to_string(&mut out).ok()?;
        out
    } else {
        std::fs::read_to_string(path).ok()?
    };
    match serde_json::from_str(&body) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable benchmark artifact");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;
    use crate::models::{ExpiryRecord, ExpiryRule, ExpiryStatus, PartialReason};

    fn cycle_status() -> CycleStatus {
        CycleStatus {
            index: "NIFTY".into(),
            attempts: 2,
            failures: 0,
            option_count: 42,
            status: ExpiryStatus::Partial,
            expiries: vec![
                ExpiryRecord {
                    rule: ExpiryRule::ThisWeek,
                    expiry_date: None,
                    status: ExpiryStatus::Ok,
                    options: 30,
                    strike_coverage: 0.9,
                    field_coverage: 0.8,
                    partial_reason: None,
                    failed: false,
                },
                ExpiryRecord {
                    rule: ExpiryRule::NextWeek,
                    expiry_date: None,
                    status: ExpiryStatus::Partial,
                    options: 12,
                    strike_coverage: 0.4,
                    field_coverage: 0.8,
                    partial_reason: Some(PartialReason::LowStrike),
                    failed: false,
                },
            ],
            stale: false,
        }
    }

    #[test]
    fn robust_zscore_flags_outlier() {
        let series = vec![100.0, 101.0, 99.0, 100.5, 100.2, 250.0];
        let (flags, scores) = detect_anomalies(&series, 3.5, 5);
        assert!(flags[5]);
        assert!(!flags[0]);
        assert!(scores[5] > 3.5);
    }

    #[test]
    fn short_series_never_flags() {
        let (flags, _) = detect_anomalies(&[1.0, 100.0], 3.5, 5);
        assert_eq!(flags, vec![false, false]);
    }

    #[test]
    fn artifact_contains_structure_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let writer = BenchmarkWriter::new(dir.path(), false, 5);
        let path = writer
            .write_artifact(
                &[cycle_status()],
                1.25,
                &BTreeMap::from([("fetch".to_string(), 0.8)]),
                &BTreeMap::new(),
                &metrics,
            )
            .unwrap();
        let body: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(body["version"], 1);
        assert_eq!(body["options_total"], 42);
        assert_eq!(body["partial_reason_totals"]["low_strike"], 1);
        assert_eq!(body["indices"][0]["expiries"][1]["status"], "PARTIAL");
        assert_eq!(body["digest_sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn digest_is_stable_for_same_logical_payload() {
        let a = json!({"x": 1, "y": {"b": 2, "a": 3}});
        let b = json!({"y": {"a": 3, "b": 2}, "x": 1});
        let da = hex::encode(Sha256::digest(canonical_json(&a).as_bytes()));
        let db = hex::encode(Sha256::digest(canonical_json(&b).as_bytes()));
        assert_eq!(da, db);
    }

    #[test]
    fn prune_keeps_latest_n() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let writer = BenchmarkWriter::new(dir.path(), false, 2);
        for _ in 0..4 {
            writer
                .write_artifact(&[cycle_status()], 1.0, &BTreeMap::new(), &BTreeMap::new(), &metrics)
                .unwrap();
            // Distinct microsecond timestamps per artifact.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(writer.artifact_paths().len(), 2);
    }

    #[test]
    fn gzip_artifact_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new(GroupGating::allow_all());
        let writer = BenchmarkWriter::new(dir.path(), true, 5);
        let path = writer
            .write_artifact(&[cycle_status()], 1.0, &BTreeMap::new(), &BTreeMap::new(), &metrics)
            .unwrap();
        assert!(path.to_string_lossy().ends_with(".json.gz"));
        let body = read_artifact(&path).unwrap();
        assert_eq!(body["options_total"], 42);
    }
}
