//! Narrow broker-provider interface.
//!
//! The orchestrator talks to the broker exclusively through [`Provider`];
//! errors carry a stable kind used for per-(index, error_kind) counters.
//! Adapters may keep a day-scoped instrument cache which must be cleared on
//! date rollover.

pub mod sim;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::models::{ExpiryRule, Instrument, OptionQuote, OptionSide};
use crate::strikes::{strike_key, strike_step};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Network(String),
    NoData(String),
    NoFutureExpiries(String),
    Invalid(String),
}

impl ProviderError {
    /// Stable token for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Network(_) => "network",
            ProviderError::NoData(_) => "no_data",
            ProviderError::NoFutureExpiries(_) => "no_future_expiries",
            ProviderError::Invalid(_) => "invalid",
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Network(m) => write!(f, "provider network error: {m}"),
            ProviderError::NoData(m) => write!(f, "provider returned no data: {m}"),
            ProviderError::NoFutureExpiries(m) => write!(f, "no future expiries: {m}"),
            ProviderError::Invalid(m) => write!(f, "invalid provider input: {m}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Broker-facing operations used by the collection cycle. Retries are
/// caller-driven; implementations return the first error.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn get_index_data(&self, index: &str) -> Result<(f64, Ohlc), ProviderError>;

    async fn get_ltp(&self, index: &str) -> Result<f64, ProviderError>;

    /// Broker ATM when available; callers fall back to rounding the LTP to
    /// the index step (see [`atm_from_price`]).
    async fn get_atm_strike(&self, index: &str) -> Result<f64, ProviderError>;

    async fn get_expiry_dates(&self, index: &str) -> Result<Vec<NaiveDate>, ProviderError>;

    async fn resolve_expiry(&self, index: &str, rule: ExpiryRule)
        -> Result<NaiveDate, ProviderError>;

    async fn get_option_instruments(
        &self,
        index: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError>;

    /// Quote map keyed by tradingsymbol. An empty map is not an error;
    /// callers synthesize zero-price quotes to keep the expiry PARTIAL.
    async fn enrich_with_quotes(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<String, OptionQuote>, ProviderError>;
}

/// Round a spot price to the nearest step-aligned strike.
pub fn atm_from_price(index: &str, price: f64) -> f64 {
    if !(price > 0.0) {
        return 0.0;
    }
    let step = strike_step(index);
    (price / step).round() * step
}

/// Synthesize zero-price quotes for instruments whose enrichment came back
/// empty (diagnostic mode). Non-option rows are skipped.
pub fn synthesize_zero_quotes(instruments: &[Instrument]) -> HashMap<String, OptionQuote> {
    instruments
        .iter()
        .filter_map(|inst| {
            let side = OptionSide::parse(&inst.instrument_type)?;
            Some((
                inst.tradingsymbol.clone(),
                OptionQuote::synthetic(inst, side),
            ))
        })
        .collect()
}

type InstrumentKey = (String, NaiveDate, i64, OptionSide);

/// Day-scoped instrument cache keyed by (index, expiry, strike, type).
/// Cleared automatically when the calendar date rolls over.
pub struct InstrumentCache {
    inner: Mutex<InstrumentCacheInner>,
}

struct InstrumentCacheInner {
    day: NaiveDate,
    map: HashMap<InstrumentKey, Instrument>,
    hits: u64,
    misses: u64,
}

impl Default for InstrumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InstrumentCacheInner {
                day: Utc::now().date_naive(),
                map: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn roll_if_needed(inner: &mut InstrumentCacheInner, today: NaiveDate) {
        if inner.day != today {
            inner.map.clear();
            inner.day = today;
        }
    }

    pub fn get(
        &self,
        index: &str,
        expiry: NaiveDate,
        strike: f64,
        side: OptionSide,
    ) -> Option<Instrument> {
        let mut inner = self.inner.lock();
        Self::roll_if_needed(&mut inner, Utc::now().date_naive());
        let key = (index.to_string(), expiry, strike_key(strike), side);
        match inner.map.get(&key).cloned() {
            Some(inst) => {
                inner.hits += 1;
                Some(inst)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, index: &str, inst: &Instrument) {
        let Some(side) = OptionSide::parse(&inst.instrument_type) else {
            return;
        };
        let mut inner = self.inner.lock();
        Self::roll_if_needed(&mut inner, Utc::now().date_naive());
        let key = (index.to_string(), inst.expiry, strike_key(inst.strike), side);
        inner.map.insert(key, inst.clone());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }

    #[cfg(test)]
    fn force_day(&self, day: NaiveDate) {
        self.inner.lock().day = day;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atm_rounds_to_index_step() {
        assert_eq!(atm_from_price("NIFTY", 20013.0), 20000.0);
        assert_eq!(atm_from_price("NIFTY", 20026.0), 20050.0);
        assert_eq!(atm_from_price("BANKNIFTY", 45049.0), 45000.0);
        assert_eq!(atm_from_price("BANKNIFTY", 45051.0), 45100.0);
        assert_eq!(atm_from_price("NIFTY", 0.0), 0.0);
    }

    fn inst(symbol: &str, itype: &str, strike: f64) -> Instrument {
        Instrument {
            tradingsymbol: symbol.to_string(),
            exchange: "NFO".into(),
            instrument_type: itype.to_string(),
            strike,
            expiry: NaiveDate::from_ymd_opt(2025, 9, 25).unwrap(),
            underlying_name: Some("NIFTY".into()),
        }
    }

    #[test]
    fn synthetic_quotes_skip_non_options() {
        let instruments = vec![
            inst("NIFTY25SEP20000CE", "CE", 20000.0),
            inst("NIFTY25SEPFUT", "FUT", 0.0),
        ];
        let quotes = synthesize_zero_quotes(&instruments);
        assert_eq!(quotes.len(), 1);
        let q = &quotes["NIFTY25SEP20000CE"];
        assert_eq!(q.last_price, 0.0);
        assert!(!q.has_full_fields());
    }

    #[test]
    fn instrument_cache_hits_and_rolls_over() {
        let cache = InstrumentCache::new();
        let i = inst("NIFTY25SEP20000CE", "CE", 20000.0);
        cache.put("NIFTY", &i);
        assert!(cache
            .get("NIFTY", i.expiry, 20000.0, OptionSide::CE)
            .is_some());
        assert_eq!(cache.stats().0, 1);
        // Simulate a previous-day cache: next access clears it.
        cache.force_day(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert!(cache
            .get("NIFTY", i.expiry, 20000.0, OptionSide::CE)
            .is_none());
        assert!(cache.is_empty());
    }
}
