//! Weekday-overlay master CSV aggregator.
//!
//! Batch tool: folds a trade date's per-offset daily CSVs into the
//! per-weekday master overlays used by dashboards.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use g6_telemetry::storage::overlay::{
    update_weekday_master_with_issues, write_quality_report, OverlayRunSummary,
};

const INDEX_DEFAULT: [&str; 4] = ["NIFTY", "BANKNIFTY", "FINNIFTY", "SENSEX"];

#[derive(Parser, Debug)]
#[command(
    name = "weekday-overlay",
    about = "Build or update weekday master overlay averages"
)]
struct Args {
    /// Root of per-offset CSV data (CsvSink output)
    #[arg(long, default_value = "data/g6_data", env = "G6_CSV_DIR")]
    base_dir: PathBuf,

    /// Root directory for weekday master overlays
    #[arg(long, default_value = "data/weekday_master")]
    output_dir: PathBuf,

    /// Target trade date (YYYY-MM-DD), defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Index symbol (repeatable); defaults to the standard set
    #[arg(long = "index")]
    indices: Vec<String>,

    /// EMA smoothing factor
    #[arg(long, default_value_t = 0.5)]
    alpha: f64,

    /// Market session open (HH:MM:SS)
    #[arg(long, default_value = "09:15:30")]
    market_open: String,

    /// Market session close (HH:MM:SS)
    #[arg(long, default_value = "15:30:00")]
    market_close: String,

    /// Write an overlay quality report next to the masters
    #[arg(long, default_value_t = false)]
    quality_report: bool,
}

fn normalize_indices(raw: &[String]) -> Vec<String> {
    if raw.is_empty() {
        return INDEX_DEFAULT.iter().map(|s| s.to_string()).collect();
    }
    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weekday_overlay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let mut total = 0usize;
    let mut summaries = Vec::new();
    for index in normalize_indices(&args.indices) {
        let mut issues = Vec::new();
        let updated = update_weekday_master_with_issues(
            &args.base_dir,
            &args.output_dir,
            &index,
            date,
            args.alpha,
            &args.market_open,
            &args.market_close,
            &mut issues,
        )?;
        info!(index = %index, date = %date, updated, issues = issues.len(), "weekday master updated");
        total += updated;
        summaries.push(OverlayRunSummary {
            index,
            date,
            updated,
            issues,
        });
    }
    if args.quality_report {
        let path = write_quality_report(&args.output_dir, date, &summaries)?;
        info!(path = %path.display(), "quality report written");
    }
    info!(total, "overlay aggregation complete");
    Ok(())
}
