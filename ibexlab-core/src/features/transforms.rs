//! Stationarity transforms and lag windows.

/// Percent returns `r_i = (p_i - p_{i-1}) / p_{i-1}`.
///
/// Same length as `prices`. `r_0` is undefined, as is any return whose
/// previous price is not a positive finite number.
pub fn pct_returns(prices: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(prices.len());
    if prices.is_empty() {
        return out;
    }
    out.push(None);
    for w in prices.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        let r = (prev.is_finite() && prev > 0.0 && cur.is_finite()).then(|| (cur - prev) / prev);
        out.push(r);
    }
    out
}

/// Inverse of [`pct_returns`]: cumulative product from a starting price.
/// Returns `returns.len() + 1` prices.
pub fn reconstruct_prices(start: f64, returns: &[f64]) -> Vec<f64> {
    let mut prices = Vec::with_capacity(returns.len() + 1);
    prices.push(start);
    let mut p = start;
    for r in returns {
        p *= 1.0 + r;
        prices.push(p);
    }
    prices
}

#[derive(Debug, Clone, PartialEq)]
pub enum LagWindow {
    /// Fewer than `lag` prior observations.
    WarmUp,
    /// The window reaches an undefined return.
    Undefined,
    /// `[r_{t-1}, r_{t-2}, .., r_{t-lag}]`, most recent first.
    Ready(Vec<f64>),
}

/// Lag window for the row at index `t`. Never reads `returns[t]` or later.
pub fn lag_window(returns: &[Option<f64>], t: usize, lag: usize) -> LagWindow {
    if t < lag || t > returns.len() {
        return LagWindow::WarmUp;
    }
    let mut window = Vec::with_capacity(lag);
    for k in 1..=lag {
        match returns[t - k] {
            Some(r) => window.push(r),
            None => return LagWindow::Undefined,
        }
    }
    LagWindow::Ready(window)
}
