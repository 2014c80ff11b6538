//! G6 Telemetry Backend Library
//!
//! Options-chain collection orchestrator, analytics builders, adaptive
//! alerting, event bus / SSE gateway and Prometheus metrics registry.
//! Exposed as a library so the binaries and integration tests share one
//! implementation.

pub mod adaptive;
pub mod analytics;
pub mod api;
pub mod collectors;
pub mod config;
pub mod events;
pub mod expiries;
pub mod filters;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod snapshots;
pub mod status;
pub mod storage;
pub mod strikes;

// Re-export the handful of types nearly every consumer touches.
pub use events::{get_event_bus, EventBus, EventRecord};
pub use metrics::{get_metrics, MetricsRegistry};
pub use models::{ExpiryRule, ExpirySnapshot, IndexParams, OptionQuote, OptionSide};
