//! Metric group gating.
//!
//! Groups subject to gating are listed in [`CONTROLLED_GROUPS`]. Two env
//! inputs drive the policy: `G6_ENABLE_METRIC_GROUPS` (allow-list; empty
//! means "all controlled groups") and `G6_DISABLE_METRIC_GROUPS` (always
//! removes, except ALWAYS_ON groups which can never be pruned).

use std::collections::HashSet;

use crate::config::env_str;

pub const GROUP_VOL_SURFACE: &str = "analytics_vol_surface";
pub const GROUP_RISK_AGG: &str = "analytics_risk_agg";
pub const GROUP_PANEL_DIFF: &str = "panel_diff";
pub const GROUP_SLA_HEALTH: &str = "sla_health";
pub const GROUP_OVERLAY_QUALITY: &str = "overlay_quality";
pub const GROUP_STORAGE: &str = "storage";
pub const GROUP_CACHE: &str = "cache";
pub const GROUP_EXPIRY_POLICY: &str = "expiry_policy";
pub const GROUP_PANELS_INTEGRITY: &str = "panels_integrity";
pub const GROUP_IV_ESTIMATION: &str = "iv_estimation";
pub const GROUP_GREEKS: &str = "greeks";
pub const GROUP_ADAPTIVE_CONTROLLER: &str = "adaptive_controller";
pub const GROUP_ADAPTIVE_FOLLOWUPS: &str = "adaptive_followups";
pub const GROUP_PROVIDER_FAILOVER: &str = "provider_failover";
pub const GROUP_EXPIRY_REMEDIATION: &str = "expiry_remediation";
pub const GROUP_SSE_INGEST: &str = "sse_ingest";
pub const GROUP_CARDINALITY: &str = "cardinality";

/// All groups subject to enable/disable gating.
pub fn controlled_groups() -> HashSet<&'static str> {
    [
        GROUP_VOL_SURFACE,
        GROUP_RISK_AGG,
        GROUP_PANEL_DIFF,
        GROUP_SLA_HEALTH,
        GROUP_OVERLAY_QUALITY,
        GROUP_STORAGE,
        GROUP_CACHE,
        GROUP_EXPIRY_POLICY,
        GROUP_PANELS_INTEGRITY,
        GROUP_IV_ESTIMATION,
        GROUP_GREEKS,
        GROUP_ADAPTIVE_CONTROLLER,
        GROUP_ADAPTIVE_FOLLOWUPS,
        GROUP_PROVIDER_FAILOVER,
        GROUP_EXPIRY_REMEDIATION,
        GROUP_SSE_INGEST,
        GROUP_CARDINALITY,
    ]
    .into_iter()
    .collect()
}

/// Groups that bypass disables and pruning: operational safety surfaces
/// must stay observable even under aggressive gating.
pub fn always_on_groups() -> HashSet<&'static str> {
    [
        GROUP_EXPIRY_REMEDIATION,
        GROUP_PROVIDER_FAILOVER,
        GROUP_SLA_HEALTH,
        GROUP_IV_ESTIMATION,
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Clone)]
pub struct GroupGating {
    /// Allow-list intersected with the controlled universe; `None` when no
    /// enable list was supplied.
    enabled: Option<HashSet<String>>,
    disabled: HashSet<String>,
    always_on: HashSet<&'static str>,
}

impl GroupGating {
    pub fn from_env() -> Self {
        Self::from_lists(
            &env_str("G6_ENABLE_METRIC_GROUPS", ""),
            &env_str("G6_DISABLE_METRIC_GROUPS", ""),
        )
    }

    pub fn from_lists(enable_raw: &str, disable_raw: &str) -> Self {
        let controlled = controlled_groups();
        let parse = |raw: &str| -> HashSet<String> {
            raw.split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect()
        };
        let enabled = if enable_raw.trim().is_empty() {
            None
        } else {
            Some(
                parse(enable_raw)
                    .into_iter()
                    .filter(|g| controlled.contains(g.as_str()))
                    .collect(),
            )
        };
        Self {
            enabled,
            disabled: parse(disable_raw),
            always_on: always_on_groups(),
        }
    }

    /// Unrestricted gating (tests, embedded registries).
    pub fn allow_all() -> Self {
        Self {
            enabled: None,
            disabled: HashSet::new(),
            always_on: always_on_groups(),
        }
    }

    pub fn is_always_on(&self, group: &str) -> bool {
        self.always_on.contains(group)
    }

    /// Whether a group may register/keep collectors. ALWAYS_ON groups
    /// bypass disables; an explicit enable list otherwise becomes the only
    /// admitted universe.
    pub fn group_allowed(&self, group: &str) -> bool {
        if self.is_always_on(group) {
            return true;
        }
        if let Some(enabled) = &self.enabled {
            return enabled.contains(group) && !self.disabled.contains(group);
        }
        !self.disabled.contains(group)
    }

    /// Groups eligible for pruning after registration (controlled, not
    /// always-on, not allowed).
    pub fn prunable(&self, group: &str) -> bool {
        controlled_groups().contains(group) && !self.is_always_on(group) && !self.group_allowed(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_lists_allows_everything() {
        let g = GroupGating::from_lists("", "");
        assert!(g.group_allowed(GROUP_VOL_SURFACE));
        assert!(g.group_allowed(GROUP_CACHE));
    }

    #[test]
    fn enable_list_becomes_allowlist() {
        let g = GroupGating::from_lists("analytics_vol_surface", "");
        assert!(g.group_allowed(GROUP_VOL_SURFACE));
        assert!(!g.group_allowed(GROUP_CACHE));
        // ALWAYS_ON bypasses the allow-list entirely.
        assert!(g.group_allowed(GROUP_SLA_HEALTH));
    }

    #[test]
    fn disable_always_wins_except_always_on() {
        let g = GroupGating::from_lists("", "analytics_vol_surface,sla_health");
        assert!(!g.group_allowed(GROUP_VOL_SURFACE));
        assert!(g.group_allowed(GROUP_SLA_HEALTH));
    }

    #[test]
    fn enable_list_with_unknown_groups_is_empty() {
        let g = GroupGating::from_lists("no_such_group", "");
        assert!(!g.group_allowed(GROUP_VOL_SURFACE));
        assert!(!g.group_allowed(GROUP_CACHE));
        assert!(g.group_allowed(GROUP_PROVIDER_FAILOVER));
    }

    #[test]
    fn prunable_reflects_allowance() {
        let g = GroupGating::from_lists("", "cache");
        assert!(g.prunable(GROUP_CACHE));
        assert!(!g.prunable(GROUP_VOL_SURFACE));
        assert!(!g.prunable(GROUP_EXPIRY_REMEDIATION));
        // Uncontrolled names never prune.
        assert!(!g.prunable("some_uncontrolled_group"));
    }
}
