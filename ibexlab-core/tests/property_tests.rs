//! Property tests for transform invariants.
//!
//! Uses proptest to verify:
//! 1. Return round-trip: prices rebuilt from returns match the originals
//! 2. Lag shape: a ready window has exactly `lag` values, most recent first
//! 3. Scaler bounds: min-max maps training samples into [0, 1]
//! 4. Macro alignment: a date only ever sees observations dated on or before it
//! 5. Event flags: overlapping windows never push a flag above 1

use chrono::{Duration, NaiveDate};
use ibexlab_core::domain::{DateRange, TradingCalendar};
use ibexlab_core::exogenous::{build_event_columns, EventWindow};
use ibexlab_core::features::{
    lag_window, pct_returns, reconstruct_prices, ChannelParams, LagWindow, ScalerKind,
};
use ibexlab_core::macro_series::{align_lenient, MacroObservation, MacroSeries, SourceFrequency};
use proptest::prelude::*;

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

// ── Strategies ───────────────────────────────────────────────────────

fn arb_prices() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(1.0..500.0_f64, 2..120)
}

fn arb_samples() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-50.0..50.0_f64, 1..200)
}

/// Sorted, distinct day offsets with values.
fn arb_observations() -> impl Strategy<Value = Vec<(i64, f64)>> {
    prop::collection::btree_map(0i64..200, -5.0..5.0_f64, 1..20)
        .prop_map(|m| m.into_iter().collect())
}

fn arb_windows() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..60, 0i64..20), 1..8)
}

// ── 1. Return round-trip ─────────────────────────────────────────────

proptest! {
    #[test]
    fn returns_round_trip(prices in arb_prices()) {
        let returns: Vec<f64> = pct_returns(&prices).into_iter().flatten().collect();
        prop_assert_eq!(returns.len(), prices.len() - 1);
        let rebuilt = reconstruct_prices(prices[0], &returns);
        for (a, b) in rebuilt.iter().zip(&prices) {
            prop_assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0), "{} vs {}", a, b);
        }
    }
}

// ── 2. Lag shape ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn lag_window_shape(prices in arb_prices(), lag in 1usize..10, t_seed in 0usize..1000) {
        let returns = pct_returns(&prices);
        let t = t_seed % returns.len();
        match lag_window(&returns, t, lag) {
            LagWindow::WarmUp => prop_assert!(t < lag),
            LagWindow::Undefined => prop_assert_eq!(t, lag, "only r_0 is undefined for positive prices"),
            LagWindow::Ready(w) => {
                prop_assert_eq!(w.len(), lag);
                for k in 1..=lag {
                    prop_assert_eq!(Some(w[k - 1]), returns[t - k]);
                }
            }
        }
    }

    /// Rewriting every return from `t` onward leaves the window at `t` alone.
    #[test]
    fn lag_window_ignores_current_and_future(prices in arb_prices(), lag in 1usize..10, t_seed in 0usize..1000) {
        let returns = pct_returns(&prices);
        let t = t_seed % returns.len();
        let mut altered = returns.clone();
        for r in altered.iter_mut().skip(t) {
            *r = Some(9.99);
        }
        prop_assert_eq!(lag_window(&returns, t, lag), lag_window(&altered, t, lag));
    }
}

// ── 3. Scaler bounds ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn min_max_bounds_training_samples(samples in arb_samples()) {
        let params = ChannelParams::fit(ScalerKind::MinMax, &samples).unwrap();
        for x in &samples {
            let y = params.apply(*x);
            prop_assert!((-1e-12..=1.0 + 1e-12).contains(&y), "{} -> {}", x, y);
        }
    }

    #[test]
    fn z_score_centers_and_inverts(samples in arb_samples()) {
        let params = ChannelParams::fit(ScalerKind::ZScore, &samples).unwrap();
        let scaled: Vec<f64> = samples.iter().map(|x| params.apply(*x)).collect();
        let mean = scaled.iter().sum::<f64>() / scaled.len() as f64;
        prop_assert!(mean.abs() < 1e-9);
        if let ChannelParams::ZScore { std, .. } = params {
            if std > 1e-6 && std != 1.0 {
                let var = scaled.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / scaled.len() as f64;
                prop_assert!((var.sqrt() - 1.0).abs() < 1e-9);
            }
        }
        for (x, y) in samples.iter().zip(&scaled) {
            prop_assert!((params.invert(*y) - x).abs() < 1e-9);
        }
    }
}

// ── 4. Macro alignment has no look-ahead ────────────────────────────

proptest! {
    #[test]
    fn macro_alignment_never_looks_ahead(obs in arb_observations(), offset in 0i64..220) {
        let observations: Vec<MacroObservation> = obs
            .iter()
            .map(|(off, v)| MacroObservation { observation_date: base() + Duration::days(*off), value: *v })
            .collect();
        let series = MacroSeries::new("rate", observations.clone(), SourceFrequency::Irregular).unwrap();
        let date = base() + Duration::days(offset);

        let expected = observations
            .iter()
            .filter(|o| o.observation_date <= date)
            .last()
            .map(|o| o.value);
        prop_assert_eq!(series.value_as_of(date), expected);

        // Dropping every later observation changes nothing at `date`.
        let past: Vec<MacroObservation> = observations
            .into_iter()
            .filter(|o| o.observation_date <= date)
            .collect();
        let truncated = MacroSeries::new("rate", past, SourceFrequency::Irregular).unwrap();
        prop_assert_eq!(
            align_lenient(&series, &[date], None),
            align_lenient(&truncated, &[date], None)
        );
    }
}

// ── 5. Event flags stay binary ───────────────────────────────────────

proptest! {
    #[test]
    fn overlapping_event_windows_stay_binary(windows in arb_windows()) {
        let events: Vec<EventWindow> = windows
            .iter()
            .enumerate()
            .map(|(i, (start, len))| EventWindow {
                event_id: format!("e{i}"),
                label: format!("event {i}"),
                category: "crisis".into(),
                start_date: base() + Duration::days(*start),
                end_date: base() + Duration::days(start + len),
            })
            .collect();
        let range = DateRange::new(base(), base() + Duration::days(90)).unwrap();
        let columns = build_event_columns(&events, &range, &TradingCalendar::weekdays()).unwrap();
        prop_assert_eq!(columns.len(), 1);

        let col = &columns[0];
        for (date, value) in col.dates.iter().zip(&col.values) {
            prop_assert!(*value <= 1);
            let inside = events.iter().any(|e| e.start_date <= *date && *date <= e.end_date);
            prop_assert_eq!(*value == 1, inside);
        }
    }
}
