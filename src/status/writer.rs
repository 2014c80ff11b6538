//! Runtime status snapshot writer.
//!
//! Serializes the operator-facing status JSON atomically (tmp + rename) at
//! the end of every cycle, drops a `.marker` file for diagnostics, and
//! returns the snapshot value so the panel-diff emitter can compare it.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

use crate::adaptive::AdaptiveAlert;
use crate::config::{env_opt, env_u64};
use crate::metrics::{unix_now, MetricsRegistry};
use crate::models::{CycleStatus, ExpiryStatus, IndexParams};

/// Bounded tail of adaptive alerts carried in the status artifact.
const ALERT_TAIL: usize = 50;

pub struct StatusInputs<'a> {
    pub cycle: u64,
    pub elapsed: f64,
    pub interval: f64,
    pub index_params: &'a [IndexParams],
    pub statuses: &'a [CycleStatus],
    pub readiness_ok: bool,
    pub readiness_reason: String,
    pub provider_name: &'a str,
    pub health: &'a [(String, String)],
    pub alerts: &'a [AdaptiveAlert],
}

pub struct StatusWriter {
    path: PathBuf,
    metrics: Arc<MetricsRegistry>,
    sys: Mutex<System>,
}

impl StatusWriter {
    pub fn new(path: impl AsRef<Path>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            metrics,
            sys: Mutex::new(System::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resource_snapshot(&self) -> (Option<f64>, Option<f64>) {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[pid]),
            sysinfo::ProcessRefreshKind::new().with_memory(),
        );
        let mem_mb = sys
            .process(pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0));
        let cpu_pct = Some(sys.global_cpu_usage() as f64);
        (mem_mb, cpu_pct)
    }

    /// Build and atomically persist the status snapshot. Returns the value
    /// written so callers can feed the panel-diff emitter.
    pub fn write(&self, inputs: &StatusInputs<'_>) -> Result<Value> {
        let metrics = &self.metrics;
        let (cycle_total, cycle_success, last_options) = metrics.cycle_summary();
        let success_rate = if cycle_total > 0 {
            Some((cycle_success as f64 / cycle_total as f64) * 100.0)
        } else {
            None
        };
        let (mem_mb, cpu_pct) = self.resource_snapshot();

        let mut indices_info = Map::new();
        let mut indices_detail = Map::new();
        for status in inputs.statuses {
            let ltp = metrics.latest_index_price(&status.index);
            indices_info.insert(
                status.index.clone(),
                json!({"ltp": ltp, "options": status.option_count}),
            );
            indices_detail.insert(
                status.index.clone(),
                json!({
                    "status": status.status.as_str(),
                    "ltp": ltp,
                    "attempts": status.attempts,
                    "failures": status.failures,
                    "stale": status.stale,
                    "expiries": status
                        .expiries
                        .iter()
                        .map(|e| {
                            json!({
                                "rule": e.rule.as_str(),
                                "status": e.status.as_str(),
                                "options": e.options,
                                "strike_coverage": e.strike_coverage,
                                "field_coverage": e.field_coverage,
                                "partial_reason": e.partial_reason.map(|r| r.as_str()),
                            })
                        })
                        .collect::<Vec<_>>(),
                }),
            );
        }

        let mut health = Map::new();
        for (component, state) in inputs.health {
            health.insert(component.clone(), json!({"status": state}));
            let healthy = state.eq_ignore_ascii_case("healthy");
            metrics.set(
                "component_health",
                &[component.as_str()],
                if healthy { 1.0 } else { 0.0 },
            );
        }

        let detail_mode = metrics.detail_mode();
        let (mode_changes, last_change_cycle, last_change_ts) = metrics.detail_mode_change_meta();
        let band_window = env_opt("G6_DETAIL_MODE_BAND_ATM_WINDOW")
            .and_then(|v| v.trim().parse::<i64>().ok());

        let mut alerts_tail: Vec<&AdaptiveAlert> = inputs.alerts.iter().collect();
        if alerts_tail.len() > ALERT_TAIL {
            alerts_tail = alerts_tail.split_off(alerts_tail.len() - ALERT_TAIL);
        }

        let any_failures = inputs.statuses.iter().any(|s| s.failures > 0);
        let status = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "cycle": inputs.cycle,
            "elapsed": (inputs.elapsed * 1000.0).round() / 1000.0,
            "interval": inputs.interval,
            "sleep_sec": (inputs.interval - inputs.elapsed).max(0.0),
            "indices": inputs
                .index_params
                .iter()
                .map(|p| p.name.clone())
                .collect::<Vec<_>>(),
            "indices_info": indices_info,
            "indices_detail": indices_detail,
            "success_rate_pct": success_rate,
            "options_last_cycle": last_options,
            "options_per_minute": metrics.gauge_value("options_per_minute", &[]),
            "api_success_rate": metrics.gauge_value("api_success_rate", &[]),
            "memory_mb": mem_mb,
            "cpu_pct": cpu_pct,
            "readiness_ok": inputs.readiness_ok,
            "readiness_reason": inputs.readiness_reason,
            "health": health,
            "provider": {
                "name": inputs.provider_name,
                "latency_ms": metrics.api_latency_ema_ms(),
            },
            "option_detail_mode": detail_mode.as_u8(),
            "option_detail_mode_str": detail_mode.as_str(),
            "option_detail_band_window": band_window,
            "option_detail_mode_change_count": mode_changes,
            "option_detail_last_change_cycle": last_change_cycle,
            "option_detail_last_change_age_sec": last_change_ts.map(|ts| (unix_now() - ts).max(0.0)),
            "memory_tier": env_u64("G6_MEMORY_TIER", 0),
            "degraded": any_failures || inputs.statuses.iter().any(|s| s.status == ExpiryStatus::Stale),
            "adaptive_alerts": alerts_tail,
        });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&status)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        if let Err(e) = std::fs::write(
            self.path.with_extension("json.marker"),
            b"status_writer_executed",
        ) {
            debug!(error = %e, "status marker write failed");
        }
        metrics.inc("runtime_status_writes", &[]);
        metrics.set("runtime_status_last_write_unixtime", &[], unix_now());
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::gating::GroupGating;
    use crate::models::{ExpiryRecord, ExpiryRule};

    fn cycle_status() -> CycleStatus {
        CycleStatus {
            index: "NIFTY".into(),
            attempts: 1,
            failures: 0,
            option_count: 12,
            status: ExpiryStatus::Ok,
            expiries: vec![ExpiryRecord {
                rule: ExpiryRule::ThisWeek,
                expiry_date: None,
                status: ExpiryStatus::Ok,
                options: 12,
                strike_coverage: 0.9,
                field_coverage: 0.8,
                partial_reason: None,
                failed: false,
            }],
            stale: false,
        }
    }

    #[test]
    fn writes_atomic_snapshot_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_status.json");
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        metrics.record_index_price("NIFTY", 20000.0);
        metrics.mark_cycle(true, 1.5, 12, 60.0);
        let writer = StatusWriter::new(&path, metrics.clone());
        let params = vec![IndexParams::new("NIFTY", vec![ExpiryRule::ThisWeek], 2, 2)];
        let statuses = vec![cycle_status()];
        let health = vec![("provider".to_string(), "healthy".to_string())];
        let status = writer
            .write(&StatusInputs {
                cycle: 7,
                elapsed: 1.5,
                interval: 60.0,
                index_params: &params,
                statuses: &statuses,
                readiness_ok: true,
                readiness_reason: "ok".into(),
                provider_name: "SimProvider",
                health: &health,
                alerts: &[],
            })
            .unwrap();

        assert!(path.exists());
        assert!(dir.path().join("runtime_status.json.marker").exists());
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, status);
        assert_eq!(on_disk["cycle"], 7);
        assert_eq!(on_disk["indices"], json!(["NIFTY"]));
        assert_eq!(on_disk["indices_info"]["NIFTY"]["ltp"], json!(20000.0));
        assert_eq!(on_disk["indices_detail"]["NIFTY"]["status"], "OK");
        assert_eq!(on_disk["sleep_sec"], json!(58.5));
        assert_eq!(on_disk["option_detail_mode"], 0);
        assert_eq!(on_disk["option_detail_mode_str"], "full");
        assert_eq!(on_disk["health"]["provider"]["status"], "healthy");
        assert!(on_disk["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(metrics.counter_value("runtime_status_writes", &[]), Some(1.0));
    }

    #[test]
    fn alert_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        let writer = StatusWriter::new(dir.path().join("s.json"), metrics);
        let alerts: Vec<AdaptiveAlert> = (0..80)
            .map(|i| {
                let mut a = AdaptiveAlert::base("interpolation_high", "NIFTY", format!("m{i}"));
                a.interpolated_fraction = Some(0.7);
                a
            })
            .collect();
        let params: Vec<IndexParams> = Vec::new();
        let status = writer
            .write(&StatusInputs {
                cycle: 1,
                elapsed: 0.1,
                interval: 60.0,
                index_params: &params,
                statuses: &[],
                readiness_ok: true,
                readiness_reason: "ok".into(),
                provider_name: "SimProvider",
                health: &[],
                alerts: &alerts,
            })
            .unwrap();
        assert_eq!(status["adaptive_alerts"].as_array().unwrap().len(), 50);
        assert_eq!(status["adaptive_alerts"][49]["message"], "m79");
    }
}
