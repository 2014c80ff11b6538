//! Expiry date selection and classification.
//!
//! Centralizes the rule -> date mapping used by the collectors and the
//! provider adapter. Candidates are deduplicated, holiday-filtered and
//! restricted to dates >= today before a rule is applied, so every rule
//! either returns a member of the filtered candidate list or fails with
//! [`ExpiryResolveError::NoFutureExpiries`].

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{env_i64, env_opt};
use crate::models::ExpiryRule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryResolveError {
    /// Candidate list empty after dedup / holiday / future filtering.
    NoFutureExpiries,
}

impl fmt::Display for ExpiryResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryResolveError::NoFutureExpiries => {
                f.write_str("no future expiries available after filtering")
            }
        }
    }
}

impl std::error::Error for ExpiryResolveError {}

/// Weekday used for weekly/monthly expiry classification (Mon=0 .. Sun=6).
/// Thursday is the NSE convention.
const DEFAULT_EXPIRY_DOW: i64 = 3;

/// Deterministic expiry selection over a provider-supplied candidate list.
#[derive(Clone)]
pub struct ExpiryService {
    /// Fixed reference date for tests; `None` resolves per call.
    pub today: Option<NaiveDate>,
    pub holidays: BTreeSet<NaiveDate>,
    pub weekly_dow: u32,
    pub monthly_dow: u32,
}

impl Default for ExpiryService {
    fn default() -> Self {
        Self {
            today: None,
            holidays: BTreeSet::new(),
            weekly_dow: DEFAULT_EXPIRY_DOW as u32,
            monthly_dow: DEFAULT_EXPIRY_DOW as u32,
        }
    }
}

impl ExpiryService {
    pub fn from_env() -> Self {
        let holidays = env_opt("G6_HOLIDAYS_FILE")
            .map(|p| load_holiday_calendar(Path::new(&p)))
            .unwrap_or_default();
        let weekly = env_i64("G6_WEEKLY_EXPIRY_DOW", DEFAULT_EXPIRY_DOW).clamp(0, 6) as u32;
        let monthly = env_i64("G6_MONTHLY_EXPIRY_DOW", DEFAULT_EXPIRY_DOW).clamp(0, 6) as u32;
        if !holidays.is_empty() {
            info!(
                holidays = holidays.len(),
                weekly_dow = weekly,
                monthly_dow = monthly,
                "expiry service configured"
            );
        }
        Self {
            today: None,
            holidays,
            weekly_dow: weekly,
            monthly_dow: monthly,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn reference_today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Filtered, sorted, future-only candidate list shared by all rules.
    fn future_candidates(
        &self,
        candidates: &[NaiveDate],
    ) -> Result<Vec<NaiveDate>, ExpiryResolveError> {
        let today = self.reference_today();
        let uniq: BTreeSet<NaiveDate> = candidates
            .iter()
            .copied()
            .filter(|d| !self.holidays.contains(d))
            .filter(|d| *d >= today)
            .collect();
        if uniq.is_empty() {
            return Err(ExpiryResolveError::NoFutureExpiries);
        }
        Ok(uniq.into_iter().collect())
    }

    /// Select an expiry date for `rule` from `candidates`.
    ///
    /// - this_week: first future candidate
    /// - next_week: second (first when only one remains)
    /// - this_month: last candidate within today's month, else the first
    ///   monthly anchor of the sorted per-month last-date list
    /// - next_month: second monthly anchor (sole anchor when only one month)
    pub fn select(
        &self,
        rule: ExpiryRule,
        candidates: &[NaiveDate],
    ) -> Result<NaiveDate, ExpiryResolveError> {
        let future = self.future_candidates(candidates)?;
        let today = self.reference_today();
        match rule {
            ExpiryRule::ThisWeek => Ok(future[0]),
            ExpiryRule::NextWeek => Ok(if future.len() >= 2 {
                future[1]
            } else {
                future[0]
            }),
            ExpiryRule::ThisMonth => {
                let month_scope: Vec<NaiveDate> = future
                    .iter()
                    .copied()
                    .filter(|d| d.year() == today.year() && d.month() == today.month())
                    .collect();
                if let Some(last) = month_scope.last() {
                    return Ok(*last);
                }
                Ok(monthly_anchors(&future)[0])
            }
            ExpiryRule::NextMonth => {
                let anchors = monthly_anchors(&future);
                Ok(if anchors.len() >= 2 {
                    anchors[1]
                } else {
                    anchors[0]
                })
            }
        }
    }

    pub fn classify(&self, expiry: NaiveDate) -> (bool, bool) {
        (
            is_weekly_expiry(expiry, self.weekly_dow),
            is_monthly_expiry(expiry, self.monthly_dow),
        )
    }
}

/// Last expiry date per (year, month), ascending. `future` must be sorted
/// and non-empty.
fn monthly_anchors(future: &[NaiveDate]) -> Vec<NaiveDate> {
    let mut month_last: BTreeMap<(i32, u32), NaiveDate> = BTreeMap::new();
    for d in future {
        month_last.insert((d.year(), d.month()), *d);
    }
    month_last.into_values().collect()
}

/// Structural weekday check only; no holiday awareness.
pub fn is_weekly_expiry(expiry: NaiveDate, weekly_dow: u32) -> bool {
    expiry.weekday().num_days_from_monday() == weekly_dow
}

/// True when the date is the last occurrence of `monthly_dow` in its month.
pub fn is_monthly_expiry(expiry: NaiveDate, monthly_dow: u32) -> bool {
    if expiry.weekday().num_days_from_monday() != monthly_dow {
        return false;
    }
    let next_same_dow = expiry + Duration::days(7);
    next_same_dow.month() != expiry.month()
}

/// Bulk selection over a shared candidate list. Rules that cannot be
/// satisfied are skipped rather than failing the batch.
pub fn select_expiries(
    service: &ExpiryService,
    rules: &[ExpiryRule],
    candidates: &[NaiveDate],
) -> Vec<(ExpiryRule, NaiveDate)> {
    rules
        .iter()
        .filter_map(|rule| service.select(*rule, candidates).ok().map(|d| (*rule, d)))
        .collect()
}

#[derive(Deserialize)]
#[serde(transparent)]
struct HolidayFile(Vec<String>);

/// Load a JSON list of YYYY-MM-DD strings. Missing or malformed files yield
/// an empty set with a warning; individual bad entries are skipped.
pub fn load_holiday_calendar(path: &Path) -> BTreeSet<NaiveDate> {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "holiday calendar not readable");
            return BTreeSet::new();
        }
    };
    match serde_json::from_str::<HolidayFile>(&raw) {
        Ok(HolidayFile(items)) => {
            let out: BTreeSet<NaiveDate> = items
                .iter()
                .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .collect();
            info!(path = %path.display(), count = out.len(), "loaded holiday calendar");
            out
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "holiday calendar parse failed");
            BTreeSet::new()
        }
    }
}
