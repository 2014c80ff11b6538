//! Non-streaming endpoints: bus stats, snapshot catalog, metrics text.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::ApiState;

pub async fn events_stats(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.bus.stats_snapshot())
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    pub index: Option<String>,
}

/// Snapshot catalog: 410 when the catalog surface is disabled, 400 when the
/// snapshot cache feature is off, JSON otherwise.
pub async fn snapshots(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SnapshotsQuery>,
) -> Response {
    if !state.cfg.catalog_http {
        return (StatusCode::GONE, "catalog http disabled").into_response();
    }
    if !state.snapshots.enabled() {
        return (StatusCode::BAD_REQUEST, "snapshot cache disabled").into_response();
    }
    let index_filter = params.index.as_deref();
    let snaps = state.snapshots.snapshots(index_filter);
    let overview = state.snapshots.overview(index_filter);
    Json(json!({
        "count": snaps.len(),
        "snapshots": snaps,
        "overview": overview,
    }))
    .into_response()
}

pub async fn metrics_exposition(State(state): State<Arc<ApiState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_text(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::events::{EventBus, EventBusConfig};
    use crate::metrics::gating::GroupGating;
    use crate::metrics::MetricsRegistry;
    use crate::snapshots::SnapshotCache;
    use std::time::Duration;

    fn state(catalog: bool, cache_enabled: bool) -> Arc<ApiState> {
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        Arc::new(ApiState {
            bus: Arc::new(EventBus::new(
                EventBusConfig::with_capacity(64),
                metrics.clone(),
            )),
            metrics,
            snapshots: Arc::new(SnapshotCache::new(cache_enabled, 8)),
            cfg: HttpConfig {
                bind: "127.0.0.1".into(),
                metrics_port: 0,
                basic_user: None,
                basic_pass: None,
                catalog_http: catalog,
                sse_keepalive: Duration::from_secs(15),
            },
        })
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn snapshots_http_gating_status_codes() {
        let rt = rt();
        let gone = rt.block_on(snapshots(
            State(state(false, true)),
            Query(SnapshotsQuery { index: None }),
        ));
        assert_eq!(gone.status(), StatusCode::GONE);

        let bad = rt.block_on(snapshots(
            State(state(true, false)),
            Query(SnapshotsQuery { index: None }),
        ));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = rt.block_on(snapshots(
            State(state(true, true)),
            Query(SnapshotsQuery { index: None }),
        ));
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[test]
    fn stats_endpoint_reflects_bus() {
        let rt = rt();
        let s = state(true, true);
        s.bus
            .publish("panel_full", json!({}), Some("panel_full"), None)
            .unwrap();
        let Json(stats) = rt.block_on(events_stats(State(s)));
        assert_eq!(stats["latest_id"], 1);
        assert_eq!(stats["generation"], 1);
    }

    #[test]
    fn metrics_exposition_is_text() {
        let rt = rt();
        let s = state(true, true);
        s.metrics.inc("collection_cycles", &[]);
        let resp = rt.block_on(metrics_exposition(State(s)));
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
