//! Panel artifacts and diff events.
//!
//! Compares each runtime-status snapshot against the previous one and emits
//! `panel_full.json` / `panel_<n>.diff.json` artifacts next to the status
//! file, plus `panel_full` (coalesced) and `panel_diff` events on the bus.
//! Diff schema: `{added, removed, changed, nested?}` with nesting bounded
//! by `G6_PANEL_DIFF_NEST_DEPTH`.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::env_usize;
use crate::events::{EventBus, EVENT_PANEL_DIFF, EVENT_PANEL_FULL};
use crate::metrics::MetricsRegistry;

/// Structured diff between two JSON objects.
///
/// Nested diffs are computed only for keys present in both sides with
/// object values; everything else lands in added/removed/changed. When the
/// depth budget runs out, the whole object pair is recorded under
/// `changed` and the truncation flag is set.
pub fn compute_diff(old: &Value, new: &Value, depth: usize, truncated: &mut bool) -> Value {
    let empty_old = Map::new();
    let empty_new = Map::new();
    let old_map = old.as_object().unwrap_or(&empty_old);
    let new_map = new.as_object().unwrap_or(&empty_new);

    let mut added = Map::new();
    let mut removed = Map::new();
    let mut changed = Map::new();
    let mut nested = Map::new();

    for (k, new_v) in new_map {
        match old_map.get(k) {
            None => {
                added.insert(k.clone(), new_v.clone());
            }
            Some(old_v) if old_v == new_v => {}
            Some(old_v) => {
                if old_v.is_object() && new_v.is_object() {
                    if depth == 0 {
                        *truncated = true;
                        changed.insert(k.clone(), json!({"old": old_v, "new": new_v}));
                    } else {
                        let sub = compute_diff(old_v, new_v, depth - 1, truncated);
                        if !diff_is_empty(&sub) {
                            nested.insert(k.clone(), sub);
                        }
                    }
                } else {
                    changed.insert(k.clone(), json!({"old": old_v, "new": new_v}));
                }
            }
        }
    }
    for (k, old_v) in old_map {
        if !new_map.contains_key(k) {
            removed.insert(k.clone(), old_v.clone());
        }
    }

    let mut out = Map::new();
    out.insert("added".into(), Value::Object(added));
    out.insert("removed".into(), Value::Object(removed));
    out.insert("changed".into(), Value::Object(changed));
    if !nested.is_empty() {
        out.insert("nested".into(), Value::Object(nested));
    }
    Value::Object(out)
}

pub fn diff_is_empty(diff: &Value) -> bool {
    let empty = |k: &str| {
        diff.get(k)
            .and_then(Value::as_object)
            .map(|m| m.is_empty())
            .unwrap_or(true)
    };
    empty("added") && empty("removed") && empty("changed") && empty("nested")
}

/// Apply a diff produced by [`compute_diff`] to `base`, reproducing the new
/// snapshot.
pub fn apply_diff(base: &Value, diff: &Value) -> Value {
    let mut out = base
        .as_object()
        .cloned()
        .unwrap_or_default();
    if let Some(removed) = diff.get("removed").and_then(Value::as_object) {
        for k in removed.keys() {
            out.remove(k);
        }
    }
    if let Some(added) = diff.get("added").and_then(Value::as_object) {
        for (k, v) in added {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(changed) = diff.get("changed").and_then(Value::as_object) {
        for (k, pair) in changed {
            if let Some(new_v) = pair.get("new") {
                out.insert(k.clone(), new_v.clone());
            }
        }
    }
    if let Some(nested) = diff.get("nested").and_then(Value::as_object) {
        for (k, sub) in nested {
            let base_child = out.get(k).cloned().unwrap_or_else(|| json!({}));
            out.insert(k.clone(), apply_diff(&base_child, sub));
        }
    }
    Value::Object(out)
}

pub struct PanelDiffEmitter {
    prev: Mutex<Option<Value>>,
    diff_counter: AtomicU64,
    last_generation: AtomicU64,
    nest_depth: usize,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
}

impl PanelDiffEmitter {
    pub fn new(bus: Arc<EventBus>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            prev: Mutex::new(None),
            diff_counter: AtomicU64::new(0),
            last_generation: AtomicU64::new(0),
            nest_depth: env_usize("G6_PANEL_DIFF_NEST_DEPTH", 3),
            bus,
            metrics,
        }
    }

    /// Emit artifacts and bus events for a freshly-written status snapshot.
    pub fn emit(&self, status: &Value, status_path: &Path) -> Result<()> {
        let dir = status_path.parent().unwrap_or_else(|| Path::new("."));
        let bus_generation = self.bus.generation();
        let mut prev_guard = self.prev.lock();

        let need_full = prev_guard.is_none()
            || self.last_generation.load(Ordering::Relaxed) != bus_generation;
        if need_full {
            let path = dir.join("panel_full.json");
            std::fs::write(&path, serde_json::to_vec(status)?)
                .with_context(|| format!("write {}", path.display()))?;
            self.metrics.inc("panel_diff_writes", &["full"]);
            // A new baseline rides the bus coalesced so late joiners and
            // the snapshot guard see it; generation advances here only.
            if let Err(e) = self.bus.publish(
                EVENT_PANEL_FULL,
                json!({"status": status}),
                Some(EVENT_PANEL_FULL),
                None,
            ) {
                debug!(error = %e, "panel_full publish failed");
            }
        } else if let Some(prev) = prev_guard.as_ref() {
            let mut truncated = false;
            let diff = compute_diff(prev, status, self.nest_depth, &mut truncated);
            if truncated {
                self.metrics.inc("panel_diff_truncated", &[]);
            }
            if !diff_is_empty(&diff) {
                let n = self.diff_counter.fetch_add(1, Ordering::Relaxed) + 1;
                let path = dir.join(format!("panel_{n}.diff.json"));
                let body = serde_json::to_vec(&diff)?;
                self.metrics.set("panel_diff_last_bytes", &[], body.len() as f64);
                std::fs::write(&path, body)
                    .with_context(|| format!("write {}", path.display()))?;
                self.metrics.inc("panel_diff_writes", &["diff"]);
                if let Err(e) =
                    self.bus
                        .publish(EVENT_PANEL_DIFF, diff, None, None)
                {
                    debug!(error = %e, "panel_diff publish failed");
                }
            }
        }

        self.last_generation
            .store(self.bus.generation(), Ordering::Relaxed);
        *prev_guard = Some(status.clone());
        Ok(())
    }
}
