//! Strike ladder construction and fast strike-set membership.

use serde::Serialize;

/// Exchange step between adjacent strikes for an index.
pub fn strike_step(index: &str) -> f64 {
    match index.to_ascii_uppercase().as_str() {
        "BANKNIFTY" | "SENSEX" => 100.0,
        _ => 50.0,
    }
}

/// Diagnostic metadata for a built strike universe.
#[derive(Debug, Clone, Serialize)]
pub struct StrikeUniverseMeta {
    pub count: usize,
    pub min_step: f64,
    pub scale_applied: Option<f64>,
    pub itm: u32,
    pub otm: u32,
}

/// Ordered strike universe around an ATM strike.
#[derive(Debug, Clone)]
pub struct StrikeUniverse {
    pub strikes: Vec<f64>,
    pub meta: StrikeUniverseMeta,
}

/// Build `atm ± i*step` for i in 1..=n on each side plus the ATM itself,
/// sorted ascending. `scale` shrinks/expands depth with a floor of 2 per
/// side. An invalid ATM produces an empty ladder (count 0).
pub fn build_strike_universe(
    atm: f64,
    n_itm: u32,
    n_otm: u32,
    index: &str,
    scale: Option<f64>,
) -> StrikeUniverse {
    if !(atm > 0.0) {
        return StrikeUniverse {
            strikes: Vec::new(),
            meta: StrikeUniverseMeta {
                count: 0,
                min_step: 0.0,
                scale_applied: scale,
                itm: 0,
                otm: 0,
            },
        };
    }
    let (itm, otm) = match scale {
        Some(s) if s > 0.0 && (s - 1.0).abs() > f64::EPSILON => (
            ((n_itm as f64 * s) as u32).max(2),
            ((n_otm as f64 * s) as u32).max(2),
        ),
        _ => (n_itm, n_otm),
    };
    let step = strike_step(index);
    let mut strikes = Vec::with_capacity((itm + otm + 1) as usize);
    for i in (1..=itm).rev() {
        strikes.push(atm - i as f64 * step);
    }
    strikes.push(atm);
    for i in 1..=otm {
        strikes.push(atm + i as f64 * step);
    }
    StrikeUniverse {
        meta: StrikeUniverseMeta {
            count: strikes.len(),
            min_step: step,
            scale_applied: scale,
            itm,
            otm,
        },
        strikes,
    }
}

/// Two-decimal scaled-integer representation for tolerant membership.
const SCALE: f64 = 100.0;

/// Fast membership, diff and coverage over a requested strike set.
/// Scaled integers avoid repeated float rounding; a +/-1 unit tolerance
/// absorbs 0.01 jitter from provider rows.
#[derive(Debug, Clone)]
pub struct StrikeIndex {
    sorted: Vec<f64>,
    scaled: std::collections::HashSet<i64>,
    pub min_step: f64,
}

impl StrikeIndex {
    pub fn build(strikes: &[f64]) -> Self {
        let mut filtered: Vec<f64> = strikes.iter().copied().filter(|s| *s > 0.0).collect();
        filtered.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let scaled = filtered.iter().map(|s| (s * SCALE).round() as i64).collect();
        let min_step = filtered
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d > 0.0)
            .fold(f64::INFINITY, f64::min);
        Self {
            sorted: filtered,
            scaled,
            min_step: if min_step.is_finite() { min_step } else { 0.0 },
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, value: f64) -> bool {
        let sv = (value * SCALE).round() as i64;
        self.scaled.contains(&sv)
            || self.scaled.contains(&(sv - 1))
            || self.scaled.contains(&(sv + 1))
    }

    /// Missing and extra strikes relative to a realized list.
    pub fn diff(&self, realized: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let r_scaled: std::collections::HashSet<i64> =
            realized.iter().map(|v| (v * SCALE).round() as i64).collect();
        let mut missing: Vec<f64> = self
            .scaled
            .iter()
            .filter(|s| !r_scaled.contains(s))
            .map(|s| *s as f64 / SCALE)
            .collect();
        let mut extra: Vec<f64> = r_scaled
            .iter()
            .filter(|s| !self.scaled.contains(s))
            .map(|s| *s as f64 / SCALE)
            .collect();
        missing.sort_by(|a, b| a.partial_cmp(b).unwrap());
        extra.sort_by(|a, b| a.partial_cmp(b).unwrap());
        (missing, extra)
    }

    /// Fraction of the requested set realized, in [0,1]. Zero for an empty
    /// request so the ratio invariant holds.
    pub fn realized_coverage(&self, realized: impl IntoIterator<Item = f64>) -> f64 {
        if self.scaled.is_empty() {
            return 0.0;
        }
        let r_scaled: std::collections::HashSet<i64> = realized
            .into_iter()
            .filter(|v| *v > 0.0)
            .map(|v| (v * SCALE).round() as i64)
            .collect();
        let matched = self
            .scaled
            .iter()
            .filter(|s| {
                r_scaled.contains(s) || r_scaled.contains(&(**s - 1)) || r_scaled.contains(&(**s + 1))
            })
            .count();
        matched as f64 / self.scaled.len() as f64
    }

    /// Rounded 2-decimal key set for filter context membership.
    pub fn key_set(&self) -> std::collections::HashSet<i64> {
        self.scaled.clone()
    }
}

/// Round a raw strike to the 2-decimal key used across the filter path.
pub fn strike_key(value: f64) -> i64 {
    (value * SCALE).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_sorted_and_centered_on_atm() {
        let u = build_strike_universe(20000.0, 3, 2, "NIFTY", None);
        assert_eq!(
            u.strikes,
            vec![19850.0, 19900.0, 19950.0, 20000.0, 20050.0, 20100.0]
        );
        assert_eq!(u.meta.count, 6);
        assert_eq!(u.meta.min_step, 50.0);
    }

    #[test]
    fn banknifty_uses_hundred_step() {
        let u = build_strike_universe(45000.0, 1, 1, "BANKNIFTY", None);
        assert_eq!(u.strikes, vec![44900.0, 45000.0, 45100.0]);
    }

    #[test]
    fn zero_atm_yields_empty_universe() {
        let u = build_strike_universe(0.0, 10, 10, "NIFTY", None);
        assert!(u.strikes.is_empty());
        assert_eq!(u.meta.count, 0);
    }

    #[test]
    fn scale_clamps_to_two_per_side() {
        let u = build_strike_universe(20000.0, 10, 10, "NIFTY", Some(0.1));
        assert_eq!(u.meta.itm, 2);
        assert_eq!(u.meta.otm, 2);
        assert_eq!(u.strikes.len(), 5);
        assert_eq!(u.meta.scale_applied, Some(0.1));
    }

    #[test]
    fn membership_tolerates_penny_jitter() {
        let idx = StrikeIndex::build(&[19950.0, 20000.0, 20050.0]);
        assert!(idx.contains(20000.0));
        assert!(idx.contains(20000.01));
        assert!(!idx.contains(20025.0));
    }

    #[test]
    fn coverage_is_ratio_over_requested_set() {
        let idx = StrikeIndex::build(&[19900.0, 19950.0, 20000.0, 20050.0]);
        let cov = idx.realized_coverage(vec![19900.0, 20000.0]);
        assert!((cov - 0.5).abs() < 1e-9);
        assert_eq!(StrikeIndex::build(&[]).realized_coverage(vec![1.0]), 0.0);
    }

    #[test]
    fn diff_reports_missing_and_extra() {
        let idx = StrikeIndex::build(&[19950.0, 20000.0]);
        let (missing, extra) = idx.diff(&[20000.0, 20100.0]);
        assert_eq!(missing, vec![19950.0]);
        assert_eq!(extra, vec![20100.0]);
    }
}
