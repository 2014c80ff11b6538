//! Persistence sinks.
//!
//! The orchestrator writes per-expiry option rows and per-index overview
//! snapshots through the narrow [`OptionsSink`] interface; [`CsvSink`] is
//! the bundled implementation producing the per-offset CSV layout consumed
//! by the weekday-overlay aggregator.

pub mod overlay;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{
    ExpiryRule, OptionQuote, OptionSide, OverviewSnapshot, SinkMetricsPayload,
};
use crate::strikes::strike_step;

/// Narrow persistence interface. Failures are reported, counted by the
/// caller, and never abort the cycle.
pub trait OptionsSink: Send + Sync {
    fn write_options_data(
        &self,
        index: &str,
        rule: ExpiryRule,
        expiry_date: NaiveDate,
        atm_strike: f64,
        quotes: &[OptionQuote],
        timestamp: DateTime<Utc>,
    ) -> Result<SinkMetricsPayload>;

    fn write_overview_snapshot(
        &self,
        index: &str,
        overview: &OverviewSnapshot,
        stale: bool,
    ) -> Result<()>;
}

/// Per-(timestamp, offset) aggregate of both option sides.
#[derive(Default, Clone)]
struct OffsetRow {
    ce: f64,
    pe: f64,
    avg_ce: f64,
    avg_pe: f64,
    ce_vol: u64,
    pe_vol: u64,
    ce_oi: u64,
    pe_oi: u64,
    ce_iv: f64,
    pe_iv: f64,
    ce_delta: f64,
    pe_delta: f64,
    ce_theta: f64,
    pe_theta: f64,
    ce_vega: f64,
    pe_vega: f64,
    ce_gamma: f64,
    pe_gamma: f64,
    ce_rho: f64,
    pe_rho: f64,
}

const DAILY_HEADER: &str = "timestamp,ce,pe,avg_ce,avg_pe,ce_vol,pe_vol,ce_oi,pe_oi,ce_iv,pe_iv,ce_delta,pe_delta,ce_theta,pe_theta,ce_vega,pe_vega,ce_gamma,pe_gamma,ce_rho,pe_rho,index,expiry_tag,offset";

pub struct CsvSink {
    base_dir: PathBuf,
}

impl CsvSink {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(crate::config::env_str("G6_CSV_DIR", "data/g6_data"))
    }

    fn append_row(path: &Path, header: &str, row: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let new_file = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        if new_file {
            writeln!(file, "{header}")?;
        }
        writeln!(file, "{row}")?;
        Ok(())
    }
}

impl OptionsSink for CsvSink {
    fn write_options_data(
        &self,
        index: &str,
        rule: ExpiryRule,
        expiry_date: NaiveDate,
        atm_strike: f64,
        quotes: &[OptionQuote],
        timestamp: DateTime<Utc>,
    ) -> Result<SinkMetricsPayload> {
        let step = strike_step(index);
        let mut offsets: BTreeMap<i64, OffsetRow> = BTreeMap::new();
        let mut put_oi = 0u64;
        let mut call_oi = 0u64;
        for q in quotes {
            let offset = if step > 0.0 {
                ((q.strike - atm_strike) / step).round() as i64
            } else {
                0
            };
            let slot = offsets.entry(offset).or_default();
            let iv = q.iv.unwrap_or(0.0);
            let g = q.greeks.unwrap_or_default();
            match q.side {
                OptionSide::CE => {
                    slot.ce += q.last_price;
                    slot.avg_ce += q.avg_price.unwrap_or(0.0);
                    slot.ce_vol += q.volume;
                    slot.ce_oi += q.oi;
                    slot.ce_iv = iv;
                    slot.ce_delta = g.delta;
                    slot.ce_theta = g.theta;
                    slot.ce_vega = g.vega;
                    slot.ce_gamma = g.gamma;
                    slot.ce_rho = g.rho;
                    call_oi += q.oi;
                }
                OptionSide::PE => {
                    slot.pe += q.last_price;
                    slot.avg_pe += q.avg_price.unwrap_or(0.0);
                    slot.pe_vol += q.volume;
                    slot.pe_oi += q.oi;
                    slot.pe_iv = iv;
                    slot.pe_delta = g.delta;
                    slot.pe_theta = g.theta;
                    slot.pe_vega = g.vega;
                    slot.pe_gamma = g.gamma;
                    slot.pe_rho = g.rho;
                    put_oi += q.oi;
                }
            }
        }

        let expiry_tag = rule.as_str();
        let date_str = timestamp.format("%Y-%m-%d").to_string();
        let ts_str = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
        let day_width = offsets.len() as u32;
        for (offset, row) in &offsets {
            let path = self
                .base_dir
                .join(index)
                .join(expiry_tag)
                .join(offset.to_string())
                .join(format!("{date_str}.csv"));
            let line = format!(
                "{ts_str},{:.2},{:.2},{:.2},{:.2},{},{},{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.6},{:.6},{:.4},{:.4},{index},{expiry_tag},{offset}",
                row.ce,
                row.pe,
                row.avg_ce,
                row.avg_pe,
                row.ce_vol,
                row.pe_vol,
                row.ce_oi,
                row.pe_oi,
                row.ce_iv,
                row.pe_iv,
                row.ce_delta,
                row.pe_delta,
                row.ce_theta,
                row.pe_theta,
                row.ce_vega,
                row.pe_vega,
                row.ce_gamma,
                row.pe_gamma,
                row.ce_rho,
                row.pe_rho,
            );
            Self::append_row(&path, DAILY_HEADER, &line)?;
        }
        debug!(index, expiry = %expiry_date, offsets = day_width, "csv rows written");

        let pcr = if call_oi > 0 {
            Some(put_oi as f64 / call_oi as f64)
        } else {
            None
        };
        Ok(SinkMetricsPayload {
            pcr,
            day_width,
            timestamp,
            expiry_code: expiry_tag.to_string(),
        })
    }

    fn write_overview_snapshot(
        &self,
        index: &str,
        overview: &OverviewSnapshot,
        stale: bool,
    ) -> Result<()> {
        let date_str = overview.generated_at.format("%Y-%m-%d").to_string();
        let path = self
            .base_dir
            .join("overview")
            .join(index)
            .join(format!("{date_str}.csv"));
        let header = "timestamp,total_indices,total_expiries,total_options,put_call_ratio,max_pain_strike,stale";
        let line = format!(
            "{},{},{},{},{},{},{}",
            overview.generated_at.format("%Y-%m-%dT%H:%M:%S"),
            overview.total_indices,
            overview.total_expiries,
            overview.total_options,
            overview
                .put_call_ratio
                .map(|v| format!("{v:.4}"))
                .unwrap_or_default(),
            overview
                .max_pain_strike
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            if stale { 1 } else { 0 },
        );
        Self::append_row(&path, header, &line)
    }
}
