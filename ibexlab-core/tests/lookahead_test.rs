//! Look-ahead contamination tests for feature rows.
//!
//! No feature at row t (lags, event flags, macro values) may depend on a
//! price dated t or later. Only the target looks forward, by the horizon.
//!
//! Method: build rows from a truncated price history (days 0..100) and from
//! the full history (days 0..200). Every row the truncated history can build
//! must match the full-history row on the same date.

use chrono::NaiveDate;
use ibexlab_core::domain::{DateRange, PriceBar, PriceSeries, TradingCalendar};
use ibexlab_core::exogenous::{build_event_columns, EventWindow};
use ibexlab_core::features::{FeatureSpec, RowBuilder, RowOutcome, ScalerKind, TargetKind};
use ibexlab_core::macro_series::{MacroColumn, MacroObservation, MacroSeries, SourceFrequency};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Deterministic random walk on weekdays.
fn make_prices(dates: &[NaiveDate]) -> PriceSeries {
    let mut price = 10.0;
    let bars = dates
        .iter()
        .enumerate()
        .map(|(i, date)| {
            let seed = (i as u64).wrapping_mul(6364136223846793005).wrapping_add(1);
            let change = ((seed >> 33) % 200) as f64 / 100.0 - 1.0; // -1% to +1%
            price *= 1.0 + change / 100.0;
            PriceBar {
                ticker: "BBVA.MC".into(),
                date: *date,
                open: price,
                high: price * 1.01,
                low: price * 0.99,
                close: price,
                adjusted_close: price,
                volume: 1_000_000,
                filled: false,
            }
        })
        .collect();
    PriceSeries::new("BBVA.MC", bars)
}

fn spec(range: DateRange, horizon: usize, events: Vec<String>, macros: Vec<String>) -> FeatureSpec {
    FeatureSpec {
        lag_window: 10,
        horizon,
        target: TargetKind::Return,
        scaler: ScalerKind::ZScore,
        full_range: range,
        train_range: range,
        event_columns: events,
        macro_columns: macros,
    }
}

#[test]
fn rows_do_not_depend_on_later_prices() {
    let calendar = TradingCalendar::weekdays();
    let range = DateRange::new(d("2024-01-01"), d("2024-12-31")).unwrap();
    let dates: Vec<NaiveDate> = calendar.trading_days(&range).into_iter().take(200).collect();
    let full = make_prices(&dates);
    let truncated = PriceSeries::new("BBVA.MC", full.bars[..100].to_vec());

    let events = build_event_columns(
        &[EventWindow {
            event_id: "stress".into(),
            label: "stress".into(),
            category: "crisis".into(),
            start_date: d("2024-02-05"),
            end_date: d("2024-03-15"),
        }],
        &range,
        &calendar,
    )
    .unwrap();
    let series = MacroSeries::new(
        "ECB_Rate",
        vec![
            MacroObservation { observation_date: d("2023-12-01"), value: 4.0 },
            MacroObservation { observation_date: d("2024-04-10"), value: 3.75 },
            MacroObservation { observation_date: d("2024-09-18"), value: 3.5 },
        ],
        SourceFrequency::Irregular,
    )
    .unwrap();
    let macros = vec![MacroColumn::build(&series, None, &range, &calendar)];

    for horizon in [1, 3] {
        let spec = spec(
            range,
            horizon,
            vec![events[0].column_name.clone()],
            vec![macros[0].column_name.clone()],
        );
        let short = RowBuilder::new(&spec, "BBVA.MC", &truncated, &events, &macros);
        let long = RowBuilder::new(&spec, "BBVA.MC", &full, &events, &macros);

        let mut compared = 0;
        for t in 0..short.len() {
            match short.build(t) {
                RowOutcome::Row(row) => {
                    let RowOutcome::Row(other) = long.build(t) else {
                        panic!("full history dropped {}", row.date);
                    };
                    assert_eq!(row, other, "row {} changed with later prices", row.date);
                    compared += 1;
                }
                RowOutcome::WarmUp => assert!(matches!(long.build(t), RowOutcome::WarmUp)),
                // The truncated history runs out of targets near its end.
                RowOutcome::Dropped(_) => {}
            }
        }
        // 100 days minus warm-up (10), the undefined first window and the
        // days without a target.
        assert_eq!(compared, 100 - 10 - 1 - (horizon - 1));
    }
}

#[test]
fn lags_exclude_the_row_date() {
    let calendar = TradingCalendar::weekdays();
    let range = DateRange::new(d("2024-01-01"), d("2024-03-29")).unwrap();
    let dates = calendar.trading_days(&range);
    let prices = make_prices(&dates);
    let spec = spec(range, 1, vec![], vec![]);
    let builder = RowBuilder::new(&spec, "BBVA.MC", &prices, &[], &[]);

    let t = 30;
    let RowOutcome::Row(row) = builder.build(t) else {
        panic!("expected a row at {t}");
    };
    let returns = builder.returns();
    // With horizon 1 the target is the return on the row date itself.
    assert_eq!(Some(row.target), returns[t]);
    assert_eq!(Some(row.lags[0]), returns[t - 1]);
    assert_eq!(row.base_close, prices.bars[t - 1].close);
}
