//! Environment-backed configuration.
//!
//! Every tunable lives behind a `G6_*` environment variable with a sane
//! default. Subsystems own a small config struct with a `from_env()`
//! constructor so tests can build explicit configs without touching the
//! process environment.

use std::env;
use std::time::Duration;

/// Parse a boolean-ish env var ("1", "true", "yes", "on" are truthy).
pub fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "y"
        ),
        Err(_) => default,
    }
}

pub fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

pub fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// How a stale cycle interacts with overview persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleWriteMode {
    /// Write normally, no stale annotation.
    Allow,
    /// Write with the stale flag set (default).
    Mark,
    /// Suppress the overview write for stale indices.
    Skip,
    /// Halt the cycle when any index is stale.
    Abort,
}

impl StaleWriteMode {
    pub fn from_env() -> Self {
        match env_str("G6_STALE_WRITE_MODE", "mark").to_ascii_lowercase().as_str() {
            "allow" => StaleWriteMode::Allow,
            "skip" => StaleWriteMode::Skip,
            "abort" => StaleWriteMode::Abort,
            _ => StaleWriteMode::Mark,
        }
    }
}

/// Top-level orchestrator configuration assembled once at startup.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Seconds between cycle starts.
    pub interval: Duration,
    pub stale_write_mode: StaleWriteMode,
    /// Field-coverage ceiling under which an expiry contributes to staleness.
    pub stale_field_cov_threshold: f64,
    pub compute_greeks: bool,
    pub estimate_iv: bool,
    pub risk_free_rate: f64,
    /// Run indices concurrently (one task per index) instead of serially.
    pub parallel_indices: bool,
    pub runtime_status_path: String,
    pub benchmark_dump_dir: Option<String>,
    pub benchmark_compress: bool,
    pub benchmark_keep_n: usize,
}

impl CycleConfig {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs_f64(env_f64("G6_CYCLE_INTERVAL", 60.0).max(1.0)),
            stale_write_mode: StaleWriteMode::from_env(),
            stale_field_cov_threshold: env_f64("G6_STALE_FIELD_COV_THRESHOLD", 0.05),
            compute_greeks: env_bool("G6_COMPUTE_GREEKS", true),
            estimate_iv: env_bool("G6_ESTIMATE_IV", true),
            risk_free_rate: env_f64("G6_RISK_FREE_RATE", 0.05),
            parallel_indices: env_bool("G6_PARALLEL_INDICES", false),
            runtime_status_path: env_str("G6_RUNTIME_STATUS_PATH", "data/runtime_status.json"),
            benchmark_dump_dir: env_opt("G6_BENCHMARK_DUMP"),
            benchmark_compress: env_bool("G6_BENCHMARK_COMPRESS", false),
            benchmark_keep_n: env_usize("G6_BENCHMARK_KEEP_N", 30),
        }
    }
}

/// HTTP server configuration (SSE gateway + metrics exposition).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    pub metrics_port: u16,
    pub basic_user: Option<String>,
    pub basic_pass: Option<String>,
    /// Catalog/snapshot HTTP surface enabled (410 otherwise).
    pub catalog_http: bool,
    /// Keepalive comment interval for idle SSE connections.
    pub sse_keepalive: Duration,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        Self {
            bind: env_str("G6_HTTP_BIND", "0.0.0.0"),
            metrics_port: env_u64("G6_METRICS_PORT", 9108) as u16,
            basic_user: env_opt("G6_HTTP_BASIC_USER"),
            basic_pass: env_opt("G6_HTTP_BASIC_PASS"),
            catalog_http: env_bool("G6_CATALOG_HTTP", true),
            sse_keepalive: Duration::from_secs_f64(env_f64("G6_SSE_KEEPALIVE_SECONDS", 15.0)),
        }
    }
}
