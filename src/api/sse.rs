//! Server-Sent-Events endpoint.
//!
//! `GET /events?types=a,b&backlog=N&force_full=1` opens a
//! `text/event-stream`. A synthetic panel_full built from the bus's latest
//! full snapshot is injected before backlog replay when `force_full=1`;
//! replay honors `Last-Event-ID`; subsequent events are polled with a short
//! cursor timeout so shutdown stays prompt.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use super::ApiState;
use crate::events::{EventBus, EventRecord, EVENT_PANEL_FULL};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_LIMIT: usize = 256;
const DEFAULT_BACKLOG: usize = 100;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub types: Option<String>,
    pub backlog: Option<usize>,
    pub force_full: Option<u8>,
}

fn parse_types(raw: Option<&str>) -> Option<HashSet<String>> {
    let raw = raw?;
    let set: HashSet<String> = raw
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn matches(filter: &Option<HashSet<String>>, event_type: &str) -> bool {
    filter
        .as_ref()
        .map(|set| set.contains(event_type))
        .unwrap_or(true)
}

fn to_sse_event(record: &EventRecord) -> Event {
    Event::default()
        .event(record.event_type.clone())
        .id(record.event_id.to_string())
        .data(record.as_sse_payload().to_string())
}

/// Synthetic panel_full frame for `force_full=1` clients, carrying at least
/// the bus generation so the client can re-sync.
fn synthetic_full(bus: &EventBus) -> Event {
    let snapshot = bus.latest_full_snapshot().unwrap_or_else(|| json!({}));
    let generation = bus.generation();
    let ist = chrono::FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("static offset");
    let payload = json!({
        "id": 0,
        "sequence": 0,
        "type": EVENT_PANEL_FULL,
        "timestamp_ist": chrono::Utc::now().with_timezone(&ist).to_rfc3339(),
        "payload": {"status": snapshot, "synthetic": true},
        "generation": generation,
    });
    Event::default()
        .event(EVENT_PANEL_FULL)
        .id("0")
        .data(payload.to_string())
}

pub async fn events_handler(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let bus = state.bus.clone();
    let filter = parse_types(params.types.as_deref());
    let backlog_limit = params.backlog.unwrap_or(DEFAULT_BACKLOG);
    let force_full = params.force_full.unwrap_or(0) == 1;
    let last_event_id: u64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    bus.consumer_started();
    let connected_at = Instant::now();
    if force_full {
        state.metrics.inc("events_full_recovery", &[]);
    }

    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        let mut cursor = last_event_id;

        if force_full {
            if tx.send(synthetic_full(&bus)).await.is_err() {
                finish(&bus, connected_at);
                return;
            }
        }

        // Backlog replay before live streaming.
        let replay = bus.get_since(cursor, Some(backlog_limit));
        for record in replay {
            cursor = cursor.max(record.event_id);
            if !matches(&filter, &record.event_type) {
                continue;
            }
            if tx.send(to_sse_event(&record)).await.is_err() {
                finish(&bus, connected_at);
                return;
            }
        }

        // Live long-poll loop; ends when the client hangs up.
        loop {
            let fresh = bus.get_since(cursor, Some(POLL_LIMIT));
            if fresh.is_empty() {
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            for record in fresh {
                cursor = cursor.max(record.event_id);
                if !matches(&filter, &record.event_type) {
                    continue;
                }
                if tx.send(to_sse_event(&record)).await.is_err() {
                    finish(&bus, connected_at);
                    return;
                }
            }
        }
        finish(&bus, connected_at);
    });

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<Event, Infallible>(event), rx))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.cfg.sse_keepalive)
            .text("keepalive"),
    )
}

fn finish(bus: &EventBus, connected_at: Instant) {
    bus.consumer_stopped();
    bus.observe_connection_duration(connected_at.elapsed().as_secs_f64());
    debug!("sse consumer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::metrics::gating::GroupGating;
    use crate::metrics::MetricsRegistry;

    fn bus() -> Arc<EventBus> {
        let metrics = Arc::new(MetricsRegistry::new(GroupGating::allow_all()));
        Arc::new(EventBus::new(EventBusConfig::with_capacity(64), metrics))
    }

    #[test]
    fn type_filter_parsing() {
        assert_eq!(parse_types(None), None);
        assert_eq!(parse_types(Some("")), None);
        let set = parse_types(Some("panel_full, panel_diff")).unwrap();
        assert!(set.contains("panel_full"));
        assert!(set.contains("panel_diff"));
        assert!(matches(&Some(set.clone()), "panel_full"));
        assert!(!matches(&Some(set), "followup_alert"));
        assert!(matches(&None, "anything"));
    }

    #[test]
    fn synthetic_full_carries_current_generation() {
        let bus = bus();
        bus.publish("panel_full", json!({"s": 1}), Some("panel_full"), None)
            .unwrap();
        bus.publish("panel_full", json!({"s": 2}), Some("panel_full"), None)
            .unwrap();
        // The Event type is opaque; assert via the snapshot + generation the
        // builder reads.
        assert_eq!(bus.generation(), 2);
        let snap = bus.latest_full_snapshot().unwrap();
        assert_eq!(snap["_generation"], json!(2));
        let _event = synthetic_full(&bus);
    }

    #[test]
    fn consumer_bookkeeping_round_trip() {
        let bus = bus();
        bus.consumer_started();
        assert_eq!(bus.stats_snapshot()["consumers"], json!(1));
        finish(&bus, Instant::now());
        assert_eq!(bus.stats_snapshot()["consumers"], json!(0));
    }
}
