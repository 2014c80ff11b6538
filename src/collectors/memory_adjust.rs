//! Memory-pressure and adaptive strike-depth scaling.
//!
//! Applies a multiplicative depth scale (floor of 2 per side) and may
//! disable greeks/IV and per-option metric emission under pressure. The
//! memory tier maps to progressively aggressive flags; explicit env
//! overrides win.

use crate::config::{env_bool, env_f64, env_u64};

#[derive(Debug, Clone, Copy)]
pub struct MemFlags {
    pub depth_scale: f64,
    pub skip_greeks: bool,
    pub drop_per_option_metrics: bool,
}

impl Default for MemFlags {
    fn default() -> Self {
        Self {
            depth_scale: 1.0,
            skip_greeks: false,
            drop_per_option_metrics: false,
        }
    }
}

impl MemFlags {
    pub fn from_env() -> Self {
        let tier = env_u64("G6_MEMORY_TIER", 0);
        let tier_defaults = match tier {
            0 | 1 => MemFlags::default(),
            2 => MemFlags {
                depth_scale: 0.6,
                skip_greeks: false,
                drop_per_option_metrics: true,
            },
            _ => MemFlags {
                depth_scale: 0.4,
                skip_greeks: true,
                drop_per_option_metrics: true,
            },
        };
        Self {
            depth_scale: env_f64("G6_MEMORY_DEPTH_SCALE", tier_defaults.depth_scale),
            skip_greeks: env_bool("G6_MEMORY_SKIP_GREEKS", tier_defaults.skip_greeks),
            drop_per_option_metrics: env_bool(
                "G6_MEMORY_DROP_PER_OPTION_METRICS",
                tier_defaults.drop_per_option_metrics,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingOutcome {
    pub itm: u32,
    pub otm: u32,
    pub allow_per_option_metrics: bool,
    pub compute_greeks: bool,
    pub estimate_iv: bool,
    pub scale_factor: Option<f64>,
}

pub fn apply_memory_and_adaptive_scaling(
    itm: u32,
    otm: u32,
    flags: MemFlags,
    compute_greeks: bool,
    estimate_iv: bool,
) -> ScalingOutcome {
    let scale = flags.depth_scale;
    let (itm, otm) = if scale > 0.0 && (scale - 1.0).abs() > f64::EPSILON {
        (
            ((itm as f64 * scale) as u32).max(2),
            ((otm as f64 * scale) as u32).max(2),
        )
    } else {
        (itm, otm)
    };
    ScalingOutcome {
        itm,
        otm,
        allow_per_option_metrics: !flags.drop_per_option_metrics,
        compute_greeks: compute_greeks && !flags.skip_greeks,
        estimate_iv: estimate_iv && !flags.skip_greeks,
        scale_factor: if (scale - 1.0).abs() > f64::EPSILON {
            Some(scale)
        } else {
            None
        },
    }
}
