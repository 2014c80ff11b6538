//! Deterministic simulated provider.
//!
//! Drives the full pipeline without a broker session: weekly/monthly expiry
//! ladders, instruments across the requested strikes, and seeded
//! pseudo-random quotes that stay stable within a (symbol, day) pair so
//! repeated cycles see coherent data.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::{atm_from_price, InstrumentCache, Ohlc, Provider, ProviderError};
use crate::expiries::{ExpiryService, is_monthly_expiry};
use crate::models::{ExpiryRule, Instrument, OptionQuote, OptionSide};
use crate::strikes::strike_step;

/// Simulated broker feed with per-index base prices.
pub struct SimProvider {
    base_prices: HashMap<String, f64>,
    expiry_service: ExpiryService,
    cache: InstrumentCache,
    /// Fraction of quotes left without volume/oi to exercise PARTIAL paths.
    pub sparse_field_ratio: f64,
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimProvider {
    pub fn new() -> Self {
        let mut base_prices = HashMap::new();
        base_prices.insert("NIFTY".to_string(), 20000.0);
        base_prices.insert("BANKNIFTY".to_string(), 45000.0);
        base_prices.insert("FINNIFTY".to_string(), 21000.0);
        base_prices.insert("SENSEX".to_string(), 66000.0);
        Self {
            base_prices,
            expiry_service: ExpiryService::default(),
            cache: InstrumentCache::new(),
            sparse_field_ratio: 0.1,
        }
    }

    pub fn with_price(mut self, index: &str, price: f64) -> Self {
        self.base_prices.insert(index.to_string(), price);
        self
    }

    fn seeded_rng(&self, token: &str) -> StdRng {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        Utc::now().date_naive().hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    fn price_of(&self, index: &str) -> Result<f64, ProviderError> {
        let base = self
            .base_prices
            .get(&index.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| ProviderError::NoData(format!("unknown index {index}")))?;
        let mut rng = self.seeded_rng(index);
        // Small deterministic intraday wobble around the base.
        Ok(base * (1.0 + rng.gen_range(-0.004..0.004)))
    }

    /// Upcoming weekly Thursdays plus the next two monthly anchors.
    fn candidate_expiries(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = today;
        while out.len() < 8 {
            if d.weekday().num_days_from_monday() == 3 {
                out.push(d);
            }
            d += Duration::days(1);
        }
        // Ensure monthly anchors are represented.
        let mut monthlies: Vec<NaiveDate> = out
            .iter()
            .copied()
            .filter(|d| is_monthly_expiry(*d, 3))
            .collect();
        while monthlies.len() < 2 {
            if is_monthly_expiry(d, 3) {
                monthlies.push(d);
                out.push(d);
            }
            d += Duration::days(1);
        }
        out.sort();
        out.dedup();
        out
    }

    fn symbol_for(index: &str, expiry: NaiveDate, strike: f64, side: OptionSide) -> String {
        format!(
            "{}{}{}{}",
            index.to_ascii_uppercase(),
            expiry.format("%y%b").to_string().to_ascii_uppercase(),
            strike as i64,
            side
        )
    }
}

#[async_trait]
impl Provider for SimProvider {
    async fn get_index_data(&self, index: &str) -> Result<(f64, Ohlc), ProviderError> {
        let price = self.price_of(index)?;
        let ohlc = Ohlc {
            open: price * 0.998,
            high: price * 1.006,
            low: price * 0.994,
            close: price,
        };
        Ok((price, ohlc))
    }

    async fn get_ltp(&self, index: &str) -> Result<f64, ProviderError> {
        self.price_of(index)
    }

    async fn get_atm_strike(&self, index: &str) -> Result<f64, ProviderError> {
        Ok(atm_from_price(index, self.price_of(index)?))
    }

    async fn get_expiry_dates(&self, index: &str) -> Result<Vec<NaiveDate>, ProviderError> {
        if !self.base_prices.contains_key(&index.to_ascii_uppercase()) {
            return Err(ProviderError::NoData(format!("unknown index {index}")));
        }
        Ok(self.candidate_expiries(Utc::now().date_naive()))
    }

    async fn resolve_expiry(
        &self,
        index: &str,
        rule: ExpiryRule,
    ) -> Result<NaiveDate, ProviderError> {
        let candidates = self.get_expiry_dates(index).await?;
        self.expiry_service
            .select(rule, &candidates)
            .map_err(|e| ProviderError::NoFutureExpiries(e.to_string()))
    }

    async fn get_option_instruments(
        &self,
        index: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError> {
        let idx = index.to_ascii_uppercase();
        if !self.base_prices.contains_key(&idx) {
            return Err(ProviderError::NoData(format!("unknown index {index}")));
        }
        let mut out = Vec::with_capacity(strikes.len() * 2);
        for &strike in strikes {
            for side in [OptionSide::CE, OptionSide::PE] {
                if let Some(cached) = self.cache.get(&idx, expiry, strike, side) {
                    out.push(cached);
                    continue;
                }
                let inst = Instrument {
                    tradingsymbol: Self::symbol_for(&idx, expiry, strike, side),
                    exchange: "NFO".to_string(),
                    instrument_type: side.as_str().to_string(),
                    strike,
                    expiry,
                    underlying_name: Some(idx.clone()),
                };
                self.cache.put(&idx, &inst);
                out.push(inst);
            }
        }
        Ok(out)
    }

    async fn enrich_with_quotes(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<String, OptionQuote>, ProviderError> {
        let mut out = HashMap::with_capacity(instruments.len());
        for inst in instruments {
            let Some(side) = OptionSide::parse(&inst.instrument_type) else {
                continue;
            };
            let idx = inst
                .underlying_name
                .clone()
                .unwrap_or_else(|| inst.tradingsymbol.clone());
            let spot = self.price_of(&idx).unwrap_or(inst.strike);
            let step = strike_step(&idx);
            let distance = match side {
                OptionSide::CE => spot - inst.strike,
                OptionSide::PE => inst.strike - spot,
            };
            let intrinsic = distance.max(0.0);
            let mut rng = self.seeded_rng(&inst.tradingsymbol);
            let time_value = (step * rng.gen_range(0.2..1.5)).max(0.05);
            let last_price = intrinsic + time_value;
            let sparse = rng.gen_bool(self.sparse_field_ratio.clamp(0.0, 1.0));
            out.insert(
                inst.tradingsymbol.clone(),
                OptionQuote {
                    symbol: inst.tradingsymbol.clone(),
                    exchange: inst.exchange.clone(),
                    last_price,
                    volume: if sparse { 0 } else { rng.gen_range(100..50_000) },
                    oi: if sparse { 0 } else { rng.gen_range(1_000..500_000) },
                    avg_price: if sparse {
                        None
                    } else {
                        Some(last_price * rng.gen_range(0.97..1.03))
                    },
                    timestamp: Some(Utc::now()),
                    strike: inst.strike,
                    side,
                    iv: None,
                    greeks: None,
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strikes::build_strike_universe;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn prices_are_stable_within_a_day() {
        let p = SimProvider::new();
        let rt = rt();
        let a = rt.block_on(p.get_ltp("NIFTY")).unwrap();
        let b = rt.block_on(p.get_ltp("NIFTY")).unwrap();
        assert_eq!(a, b);
        assert!(rt.block_on(p.get_ltp("NOPE")).is_err());
    }

    #[test]
    fn expiry_candidates_are_future_thursdays() {
        let p = SimProvider::new();
        let rt = rt();
        let dates = rt.block_on(p.get_expiry_dates("NIFTY")).unwrap();
        assert!(dates.len() >= 8);
        let today = Utc::now().date_naive();
        assert!(dates.iter().all(|d| *d >= today));
        assert!(dates
            .iter()
            .all(|d| d.weekday().num_days_from_monday() == 3));
    }

    #[test]
    fn instruments_cover_both_sides_of_every_strike() {
        let p = SimProvider::new();
        let rt = rt();
        let expiry = rt
            .block_on(p.resolve_expiry("NIFTY", ExpiryRule::ThisWeek))
            .unwrap();
        let universe = build_strike_universe(20000.0, 2, 2, "NIFTY", None);
        let instruments = rt
            .block_on(p.get_option_instruments("NIFTY", expiry, &universe.strikes))
            .unwrap();
        assert_eq!(instruments.len(), universe.strikes.len() * 2);
        let quotes = rt.block_on(p.enrich_with_quotes(&instruments)).unwrap();
        assert_eq!(quotes.len(), instruments.len());
        assert!(quotes.values().all(|q| q.last_price > 0.0));
    }
}
