//! Short-gap repair by linear interpolation in trading-day steps.

use crate::domain::PriceBar;
use chrono::NaiveDate;

fn lerp(a: f64, b: f64, w: f64) -> f64 {
    a + (b - a) * w
}

/// Bars for `missing` (consecutive trading days between `before` and
/// `after`), each field interpolated linearly. Interpolated bars are marked
/// `filled`.
///
/// Convex combinations keep every structural invariant of the neighbours
/// (high >= low, open and close inside the range, positive prices).
pub fn interpolate_gap(before: &PriceBar, after: &PriceBar, missing: &[NaiveDate]) -> Vec<PriceBar> {
    let steps = (missing.len() + 1) as f64;
    missing
        .iter()
        .enumerate()
        .map(|(i, &date)| {
            let w = (i + 1) as f64 / steps;
            PriceBar {
                ticker: before.ticker.clone(),
                date,
                open: lerp(before.open, after.open, w),
                high: lerp(before.high, after.high, w),
                low: lerp(before.low, after.low, w),
                close: lerp(before.close, after.close, w),
                adjusted_close: lerp(before.adjusted_close, after.adjusted_close, w),
                volume: lerp(before.volume as f64, after.volume as f64, w).round() as i64,
                filled: true,
            }
        })
        .collect()
}
