//! HTTP surface: SSE gateway, bus stats, snapshots and Prometheus
//! exposition, with optional Basic auth.

pub mod routes;
pub mod sse;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::Engine;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::HttpConfig;
use crate::events::EventBus;
use crate::metrics::MetricsRegistry;
use crate::snapshots::SnapshotCache;

pub struct ApiState {
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub snapshots: Arc<SnapshotCache>,
    pub cfg: HttpConfig,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", get(sse::events_handler))
        .route("/events/stats", get(routes::events_stats))
        .route("/snapshots", get(routes::snapshots))
        .route("/metrics", get(routes::metrics_exposition))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Optional Basic auth: enforced only when both user and pass are set.
async fn basic_auth(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (Some(user), Some(pass)) = (&state.cfg.basic_user, &state.cfg.basic_pass) else {
        return Ok(next.run(request).await);
    };
    let expected = format!("{user}:{pass}");
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .map(|raw| raw == expected.as_bytes())
        .unwrap_or(false);
    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
