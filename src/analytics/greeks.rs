//! Option pricing: Black-Scholes greeks and Newton-Raphson implied vol.
//!
//! Continuous-dividend variant; theta scaled to per-day, vega per 1% IV
//! move, rho per 1% rate move. Same-day expiries use the intraday time
//! remaining until the 15:30 IST close instead of truncating to zero.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use lazy_static::lazy_static;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use crate::config::{env_f64, env_usize};

lazy_static! {
    static ref STD_NORMAL: Normal = Normal::new(0.0, 1.0).expect("unit normal");
}

fn norm_cdf(x: f64) -> f64 {
    STD_NORMAL.cdf(x)
}

fn norm_pdf(x: f64) -> f64 {
    STD_NORMAL.pdf(x)
}

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Market close used for date-only expiries (IST).
fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()
}

fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

/// Fractional years until the 15:30 close on `expiry`, clamped at zero.
pub fn time_to_expiry_years(expiry: NaiveDate, now: DateTime<Utc>) -> f64 {
    let close_local = expiry.and_time(market_close());
    let Some(close) = close_local.and_local_timezone(ist()).single() else {
        return 0.0;
    };
    let seconds = (close.with_timezone(&Utc) - now).num_seconds() as f64;
    (seconds / SECONDS_PER_YEAR).max(0.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BsOutputs {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

#[derive(Debug, Clone)]
pub struct IvSolverConfig {
    pub precision: f64,
    pub max_iterations: usize,
    pub min_iv: f64,
    pub max_iv: f64,
}

impl Default for IvSolverConfig {
    fn default() -> Self {
        Self {
            precision: 1e-5,
            max_iterations: 100,
            min_iv: 0.01,
            max_iv: 5.0,
        }
    }
}

impl IvSolverConfig {
    pub fn from_env() -> Self {
        Self {
            precision: env_f64("G6_IV_PRECISION", 1e-5),
            max_iterations: env_usize("G6_IV_MAX_ITERATIONS", 100),
            min_iv: env_f64("G6_IV_MIN", 0.01),
            max_iv: env_f64("G6_IV_MAX", 5.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptionGreeks {
    pub risk_free_rate: f64,
    pub iv: IvSolverConfig,
}

impl OptionGreeks {
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            iv: IvSolverConfig::from_env(),
        }
    }

    /// Theoretical price and greeks. Expired or zero-vol inputs fall back to
    /// intrinsic value with step deltas and zero second-order greeks.
    pub fn black_scholes(
        &self,
        is_call: bool,
        s: f64,
        k: f64,
        t_years: f64,
        sigma: f64,
        q: f64,
    ) -> BsOutputs {
        let r = self.risk_free_rate;
        if t_years <= 0.0 || sigma <= 0.0 || s <= 0.0 || k <= 0.0 {
            return intrinsic_value(is_call, s, k);
        }
        let sqrt_t = t_years.sqrt();
        let d1 = ((s / k).ln() + (r - q + 0.5 * sigma * sigma) * t_years) / (sigma * sqrt_t);
        let d2 = d1 - sigma * sqrt_t;
        let disc_q = (-q * t_years).exp();
        let disc_r = (-r * t_years).exp();

        let price = if is_call {
            s * disc_q * norm_cdf(d1) - k * disc_r * norm_cdf(d2)
        } else {
            k * disc_r * norm_cdf(-d2) - s * disc_q * norm_cdf(-d1)
        };
        let delta = if is_call {
            disc_q * norm_cdf(d1)
        } else {
            disc_q * (norm_cdf(d1) - 1.0)
        };
        let gamma = disc_q * norm_pdf(d1) / (s * sigma * sqrt_t);

        let mut theta_annual = -(s * sigma * disc_q * norm_pdf(d1)) / (2.0 * sqrt_t);
        if is_call {
            theta_annual -= r * k * disc_r * norm_cdf(d2) - q * s * disc_q * norm_cdf(d1);
        } else {
            theta_annual -= r * k * disc_r * norm_cdf(-d2) - q * s * disc_q * norm_cdf(-d1);
        }
        let theta = theta_annual / 365.0;

        let vega = s * disc_q * norm_pdf(d1) * sqrt_t / 100.0;
        let rho = if is_call {
            k * t_years * disc_r * norm_cdf(d2) / 100.0
        } else {
            -k * t_years * disc_r * norm_cdf(-d2) / 100.0
        };

        BsOutputs {
            price,
            delta,
            gamma,
            theta,
            vega,
            rho,
        }
    }

    /// Newton-Raphson implied volatility. Returns (iv, iterations). The best
    /// bounded guess is returned when the solver does not converge.
    pub fn implied_volatility(
        &self,
        is_call: bool,
        s: f64,
        k: f64,
        t_years: f64,
        market_price: f64,
        q: f64,
    ) -> (f64, usize) {
        let cfg = &self.iv;
        if t_years <= 0.0 {
            return (0.0, 0);
        }
        if market_price <= 0.01 {
            return (cfg.min_iv, 0);
        }
        let mut sigma = 0.3_f64.clamp(cfg.min_iv, cfg.max_iv);
        let mut iterations = 0;
        for i in 0..cfg.max_iterations {
            iterations = i + 1;
            let out = self.black_scholes(is_call, s, k, t_years, sigma, q);
            let diff = out.price - market_price;
            if diff.abs() < cfg.precision {
                return (sigma, iterations);
            }
            // Vega is per 1% move; rescale to the raw derivative.
            let vega = out.vega * 100.0;
            if vega.abs() < 1e-10 {
                return (sigma, iterations);
            }
            sigma = (sigma - diff / vega).clamp(cfg.min_iv, cfg.max_iv);
        }
        (sigma, iterations)
    }
}

fn intrinsic_value(is_call: bool, s: f64, k: f64) -> BsOutputs {
    let (price, delta) = if is_call {
        ((s - k).max(0.0), if s > k { 1.0 } else { 0.0 })
    } else {
        ((k - s).max(0.0), if s < k { -1.0 } else { 0.0 })
    };
    BsOutputs {
        price,
        delta,
        ..Default::default()
    }
}
