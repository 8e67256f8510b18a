//! Seeded synthetic quotes for offline runs and tests.
//!
//! Closes follow a geometric random walk over the trading calendar. Each
//! symbol draws from its own RNG whose seed is derived from the master seed
//! and the symbol via BLAKE3, so output does not depend on fetch order or
//! thread scheduling.

use super::provider::{DataError, DataProvider, DataSource, FetchResult};
use crate::domain::{DateRange, PriceBar, TradingCalendar};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    seed: u64,
    calendar: TradingCalendar,
    daily_vol: f64,
    /// Trading days the generator leaves out, to simulate feed gaps.
    missing: BTreeSet<NaiveDate>,
}

impl SyntheticProvider {
    pub fn new(seed: u64, calendar: TradingCalendar) -> Self {
        Self {
            seed,
            calendar,
            daily_vol: 0.015,
            missing: BTreeSet::new(),
        }
    }

    pub fn with_daily_vol(mut self, vol: f64) -> Self {
        self.daily_vol = vol;
        self
    }

    pub fn with_missing_dates(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.missing.extend(dates);
        self
    }

    /// Per-symbol seed, independent of call order.
    pub fn sub_seed(&self, symbol: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(symbol.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn generate(&self, symbol: &str, range: &DateRange) -> Vec<PriceBar> {
        let mut rng = StdRng::seed_from_u64(self.sub_seed(symbol));
        let mut close = 5.0 + rng.gen::<f64>() * 10.0;
        let volume_base: i64 = rng.gen_range(5_000_000..40_000_000);

        let mut bars = Vec::new();
        for date in self.calendar.trading_days(range) {
            let prev = close;
            let ret = self.daily_vol * standard_normal(&mut rng);
            close = (prev * ret.exp()).max(0.01);

            if self.missing.contains(&date) {
                continue;
            }

            let open = prev;
            let spread = (close * self.daily_vol * rng.gen::<f64>()).max(0.001);
            let high = open.max(close) + spread;
            let low = (open.min(close) - spread).max(0.005);
            let volume = volume_base + rng.gen_range(-1_000_000..1_000_000);

            bars.push(PriceBar {
                ticker: symbol.to_string(),
                date,
                open,
                high,
                low,
                close,
                adjusted_close: close,
                volume: volume.max(0),
                filled: false,
            });
        }
        bars
    }
}

/// Box-Muller transform.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl DataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(&self, symbol: &str, range: &DateRange) -> Result<FetchResult, DataError> {
        let bars = self.generate(symbol, range);
        if bars.is_empty() {
            return Err(DataError::EmptyRange {
                symbol: symbol.to_string(),
                range: *range,
            });
        }
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: DataSource::Synthetic,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}
