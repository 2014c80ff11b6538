//! G6 telemetry daemon.
//!
//! Wires the simulated provider, CSV sink, metrics registry, event bus and
//! snapshot cache into the collection loop, and serves the SSE gateway plus
//! Prometheus exposition over HTTP.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use g6_telemetry::api::{self, ApiState};
use g6_telemetry::collectors::{default_index_params, CycleDriver};
use g6_telemetry::config::{CycleConfig, HttpConfig};
use g6_telemetry::events::get_event_bus;
use g6_telemetry::metrics::get_metrics;
use g6_telemetry::provider::sim::SimProvider;
use g6_telemetry::snapshots::get_snapshot_cache;
use g6_telemetry::storage::CsvSink;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "g6_telemetry=info,g6=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cycle_cfg = CycleConfig::from_env();
    let http_cfg = HttpConfig::from_env();
    let metrics = get_metrics();
    let bus = get_event_bus();
    let snapshots = get_snapshot_cache();

    let provider = Arc::new(SimProvider::new());
    let sink = Arc::new(CsvSink::from_env());
    let index_params = default_index_params();
    info!(
        indices = index_params.len(),
        interval_s = cycle_cfg.interval.as_secs_f64(),
        "starting collection orchestrator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP gateway: SSE, stats, snapshots, /metrics.
    let api_state = Arc::new(ApiState {
        bus: bus.clone(),
        metrics: metrics.clone(),
        snapshots: snapshots.clone(),
        cfg: http_cfg.clone(),
    });
    let app = api::router(api_state);
    let addr = format!("{}:{}", http_cfg.bind, http_cfg.metrics_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "http gateway listening");
    let mut http_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "http server terminated");
        }
    });

    let mut driver = CycleDriver::new(
        provider,
        "SimProvider",
        sink,
        metrics,
        bus,
        snapshots,
        index_params,
        cycle_cfg,
    );
    let driver_shutdown = shutdown_rx.clone();
    let collector = tokio::spawn(async move {
        driver.run_forever(driver_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("install ctrl-c handler")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = collector.await;
    let _ = server.await;
    Ok(())
}
