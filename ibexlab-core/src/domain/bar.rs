//! Daily OHLCV bars and per-ticker series.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily OHLCV bar for one ticker.
///
/// Bars are immutable once ingested. A re-fetch produces a new snapshot; it
/// never edits bars in place. `filled` marks bars synthesized by the integrity
/// validator's short-gap interpolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: f64,
    pub volume: i64,
    #[serde(default)]
    pub filled: bool,
}

impl PriceBar {
    /// Returns true if any price field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan()
            || self.high.is_nan()
            || self.low.is_nan()
            || self.close.is_nan()
            || self.adjusted_close.is_nan()
    }

    /// Structural sanity: positive prices, open/close inside [low, high], volume >= 0.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
            && self.low > 0.0
            && self.adjusted_close > 0.0
            && self.volume >= 0
    }

    /// Ratio between adjusted and raw close (cumulative split/dividend factor).
    pub fn adjustment_factor(&self) -> f64 {
        self.adjusted_close / self.close
    }

    /// Same-content comparison ignoring the `filled` marker.
    pub fn same_quote(&self, other: &PriceBar) -> bool {
        self.date == other.date
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.adjusted_close == other.adjusted_close
            && self.volume == other.volume
    }
}

/// Ordered bars for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub ticker: String,
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(ticker: impl Into<String>, bars: Vec<PriceBar>) -> Self {
        Self {
            ticker: ticker.into(),
            bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.bars.iter().map(|b| b.date).collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    /// Dates strictly increasing (no duplicates, no disorder).
    pub fn is_strictly_increasing(&self) -> bool {
        self.bars.windows(2).all(|w| w[0].date < w[1].date)
    }
}
