//! Adaptive degrade exit controller.
//!
//! Manages the event bus degraded mode using backlog and latency signals.
//! Entry still happens via the static backlog threshold in the bus; once
//! degraded, this controller seeks the earliest safe exit satisfying both
//! signals over a hysteresis window.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::{env_f64, env_usize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveState {
    Normal,
    Degraded,
    ExitPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ExitDegraded,
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Average backlog ratio at or below which exit becomes a candidate.
    pub exit_backlog_ratio: f64,
    /// Stability window both signals must hold for, seconds.
    pub exit_window_seconds: f64,
    /// p95 serialization latency budget, milliseconds.
    pub latency_budget_ms: f64,
    pub reentry_cooldown_seconds: f64,
    /// Minimum backlog samples before exit evaluation.
    pub min_samples: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            exit_backlog_ratio: 0.4,
            exit_window_seconds: 5.0,
            latency_budget_ms: 50.0,
            reentry_cooldown_seconds: 10.0,
            min_samples: 10,
        }
    }
}

impl AdaptiveConfig {
    pub fn from_env() -> Self {
        Self {
            exit_backlog_ratio: env_f64("G6_ADAPT_EXIT_BACKLOG_RATIO", 0.4),
            exit_window_seconds: env_f64("G6_ADAPT_EXIT_WINDOW_SECONDS", 5.0),
            latency_budget_ms: env_f64("G6_ADAPT_LAT_BUDGET_MS", 50.0),
            reentry_cooldown_seconds: env_f64("G6_ADAPT_REENTRY_COOLDOWN_SECONDS", 10.0),
            min_samples: env_usize("G6_ADAPT_MIN_SAMPLES", 10),
        }
    }
}

pub struct AdaptiveController {
    pub config: AdaptiveConfig,
    state: AdaptiveState,
    backlog_samples: VecDeque<(Instant, f64)>,
    latency_samples: VecDeque<(Instant, f64)>,
    last_state_change: Instant,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            state: AdaptiveState::Normal,
            backlog_samples: VecDeque::new(),
            latency_samples: VecDeque::new(),
            last_state_change: Instant::now(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AdaptiveConfig::from_env())
    }

    pub fn state(&self) -> AdaptiveState {
        self.state
    }

    pub fn reset(&mut self) {
        self.backlog_samples.clear();
        self.latency_samples.clear();
        self.state = AdaptiveState::Normal;
        self.last_state_change = Instant::now();
    }

    pub fn notify_enter_degraded(&mut self) {
        self.state = AdaptiveState::Degraded;
        self.last_state_change = Instant::now();
    }

    pub fn notify_manual_exit(&mut self) {
        self.state = AdaptiveState::Normal;
        self.last_state_change = Instant::now();
    }

    /// Drop accumulated samples; used when the backlog collapses sharply so
    /// stale high-ratio samples do not delay the exit.
    pub fn clear_samples(&mut self) {
        self.backlog_samples.clear();
        self.latency_samples.clear();
    }

    /// Feed latest signals. Returns a transition directive when the caller
    /// should flip the degraded flag.
    pub fn update(
        &mut self,
        backlog: usize,
        capacity: usize,
        serialize_latency_s: Option<f64>,
    ) -> Option<Transition> {
        self.update_at(Instant::now(), backlog, capacity, serialize_latency_s)
    }

    /// Clock-injected variant for deterministic tests.
    pub fn update_at(
        &mut self,
        now: Instant,
        backlog: usize,
        capacity: usize,
        serialize_latency_s: Option<f64>,
    ) -> Option<Transition> {
        if capacity == 0 {
            return None;
        }
        let ratio = (backlog as f64 / capacity as f64).clamp(0.0, 1.0);
        self.backlog_samples.push_back((now, ratio));
        if let Some(lat) = serialize_latency_s {
            if lat >= 0.0 {
                self.latency_samples.push_back((now, lat));
            }
        }
        let window = self.config.exit_window_seconds;
        while let Some((ts, _)) = self.backlog_samples.front() {
            if now.duration_since(*ts).as_secs_f64() > window {
                self.backlog_samples.pop_front();
            } else {
                break;
            }
        }
        while let Some((ts, _)) = self.latency_samples.front() {
            if now.duration_since(*ts).as_secs_f64() > window {
                self.latency_samples.pop_front();
            } else {
                break;
            }
        }

        if self.state == AdaptiveState::Normal {
            return None;
        }
        if self.backlog_samples.len() < self.config.min_samples {
            return None;
        }
        let avg_ratio: f64 = self.backlog_samples.iter().map(|(_, r)| r).sum::<f64>()
            / self.backlog_samples.len() as f64;
        let latency_ok = if self.latency_samples.is_empty() {
            true
        } else {
            let mut vals: Vec<f64> = self.latency_samples.iter().map(|(_, s)| *s).collect();
            vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = ((vals.len() as f64 * 0.95) as usize).saturating_sub(1);
            vals[idx.min(vals.len() - 1)] * 1000.0 <= self.config.latency_budget_ms
        };

        match self.state {
            AdaptiveState::Degraded => {
                if avg_ratio <= self.config.exit_backlog_ratio && latency_ok {
                    self.state = AdaptiveState::ExitPending;
                    self.last_state_change = now;
                }
                None
            }
            AdaptiveState::ExitPending => {
                if avg_ratio > self.config.exit_backlog_ratio || !latency_ok {
                    self.state = AdaptiveState::Degraded;
                    self.last_state_change = now;
                    return None;
                }
                if now.duration_since(self.last_state_change).as_secs_f64()
                    >= self.config.exit_window_seconds
                {
                    self.state = AdaptiveState::Normal;
                    self.last_state_change = now;
                    return Some(Transition::ExitDegraded);
                }
                None
            }
            AdaptiveState::Normal => None,
        }
    }
}
