//! Criterion benchmarks for IbexLab hot paths.
//!
//! Benchmarks:
//! 1. Returns and lag windows over a full price history
//! 2. Row building with event and macro columns
//! 3. Scaler fitting on the training range
//! 4. Full feature assembly against an on-disk store

use chrono::{NaiveDate, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use ibexlab_core::config::{FeatureSettings, ValidationConfig};
use ibexlab_core::domain::{Checksum, ConfigHash, DateRange, PriceBar, PriceSeries, TradingCalendar};
use ibexlab_core::exogenous::{build_event_columns, run_event_builder, EventWindow};
use ibexlab_core::features::{
    lag_window, pct_returns, FeatureAssembler, FeatureSpec, RowBuilder, RowOutcome, Scaler,
    ScalerKind, TargetKind, RETURN_CHANNEL,
};
use ibexlab_core::integrity::{run_validation, IntegrityValidator};
use ibexlab_core::lineage::LineageLog;
use ibexlab_core::macro_series::{
    run_macro_aggregator, MacroColumn, MacroInput, MacroObservation, MacroSeries, SourceFrequency,
};
use ibexlab_core::store::{ArtifactKey, ArtifactStore};

// ── Helpers ──────────────────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Weekday range holding roughly `days` trading days from 2010.
fn range_for(days: usize) -> DateRange {
    let start = d(2010, 1, 4);
    let end = start + chrono::Duration::days((days as f64 * 7.0 / 5.0).ceil() as i64);
    DateRange::new(start, end).unwrap()
}

fn make_bars(ticker: &str, dates: &[NaiveDate]) -> Vec<PriceBar> {
    dates
        .iter()
        .enumerate()
        .map(|(i, date)| {
            let close = 10.0 + (i as f64 * 0.1).sin() * 2.0;
            PriceBar {
                ticker: ticker.into(),
                date: *date,
                open: close - 0.05,
                high: close + 0.2,
                low: close - 0.2,
                close,
                adjusted_close: close,
                volume: 1_000_000 + (i as i64 % 500_000),
                filled: false,
            }
        })
        .collect()
}

fn crisis_windows() -> Vec<EventWindow> {
    (0..8)
        .map(|k| EventWindow {
            event_id: format!("c{k}"),
            label: format!("crisis {k}"),
            category: if k % 2 == 0 { "crisis" } else { "election" }.into(),
            start_date: d(2010 + k, 3, 1),
            end_date: d(2010 + k, 5, 31),
        })
        .collect()
}

fn rate_series() -> MacroSeries {
    let observations = (0..60)
        .map(|k| MacroObservation {
            observation_date: d(2009 + k / 4, 1 + (k as u32 % 4) * 3, 1),
            value: 0.25 * (k % 16) as f64,
        })
        .collect();
    MacroSeries::new("ECB_Rate", observations, SourceFrequency::Quarterly).unwrap()
}

fn spec(range: DateRange, events: Vec<String>, macros: Vec<String>) -> FeatureSpec {
    let train_end = range.start + (range.end - range.start) * 7 / 10;
    FeatureSpec {
        lag_window: 20,
        horizon: 1,
        target: TargetKind::Return,
        scaler: ScalerKind::ZScore,
        full_range: range,
        train_range: DateRange::new(range.start, train_end).unwrap(),
        event_columns: events,
        macro_columns: macros,
    }
}

// ── 1. Returns and lag windows ───────────────────────────────────────

fn bench_transforms(c: &mut Criterion) {
    let mut group = c.benchmark_group("transforms");
    let calendar = TradingCalendar::weekdays();

    for &days in &[252, 1260, 2520] {
        let dates = calendar.trading_days(&range_for(days));
        let closes: Vec<f64> = make_bars("BBVA.MC", &dates).iter().map(|b| b.close).collect();

        group.bench_with_input(BenchmarkId::new("returns_and_lags_20", days), &days, |b, _| {
            b.iter(|| {
                let returns = pct_returns(black_box(&closes));
                (0..returns.len())
                    .map(|t| lag_window(&returns, t, 20))
                    .count()
            });
        });
    }

    group.finish();
}

// ── 2. Row building ──────────────────────────────────────────────────

fn bench_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_builder");
    let calendar = TradingCalendar::bme();

    for &days in &[1260, 2520] {
        let range = range_for(days);
        let dates = calendar.trading_days(&range);
        let prices = PriceSeries::new("BBVA.MC", make_bars("BBVA.MC", &dates));
        let events = build_event_columns(&crisis_windows(), &range, &calendar).unwrap();
        let macros = vec![MacroColumn::build(&rate_series(), None, &range, &calendar)];
        let spec = spec(
            range,
            events.iter().map(|e| e.column_name.clone()).collect(),
            vec![macros[0].column_name.clone()],
        );

        group.bench_with_input(BenchmarkId::new("all_rows", days), &days, |b, _| {
            b.iter(|| {
                let builder = RowBuilder::new(&spec, "BBVA.MC", black_box(&prices), &events, &macros);
                (0..builder.len())
                    .filter(|&t| matches!(builder.build(t), RowOutcome::Row(_)))
                    .count()
            });
        });
    }

    group.finish();
}

// ── 3. Scaler fit ────────────────────────────────────────────────────

fn bench_scaler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaler_fit");
    let range = range_for(2520);
    let mut samples = BTreeMap::new();
    samples.insert(
        RETURN_CHANNEL.to_string(),
        (0..2520).map(|i| (i as f64 * 0.37).sin() * 0.02).collect::<Vec<f64>>(),
    );
    samples.insert(
        "MACRO_ECB_Rate".to_string(),
        (0..2520).map(|i| (i / 60) as f64 * 0.25).collect::<Vec<f64>>(),
    );

    for kind in [ScalerKind::ZScore, ScalerKind::MinMax] {
        group.bench_function(format!("{kind:?}_2520"), |b| {
            b.iter(|| {
                Scaler::fit(
                    "BBVA.MC",
                    ConfigHash("bench".into()),
                    kind,
                    range,
                    black_box(&samples),
                )
            });
        });
    }

    group.finish();
}

// ── 4. Full assembly ─────────────────────────────────────────────────

fn bench_assemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble");
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path().join("cache"));
    let lineage = LineageLog::new(dir.path().join("lineage.jsonl"));
    let calendar = TradingCalendar::bme();
    let range = range_for(1260);

    let dates = calendar.trading_days(&range);
    store
        .put_raw_bars(
            &ArtifactKey::raw_snapshot("BBVA.MC", &range),
            &make_bars("BBVA.MC", &dates),
        )
        .unwrap();
    let validator = IntegrityValidator::new(calendar.clone(), ValidationConfig::default());
    run_validation(&validator, &store, &lineage, "BBVA.MC", &range).unwrap();
    let events = run_event_builder(&crisis_windows(), &calendar, &range, &store, &lineage).unwrap();
    let input = MacroInput {
        series: rate_series(),
        default: None,
        source_checksum: Checksum::of_bytes(b"bench"),
        source_id: "source/macro/bench.csv".into(),
    };
    let macros = run_macro_aggregator(&[input], &calendar, &range, &store, &lineage).unwrap();

    let spec = spec(
        range,
        events.columns.iter().map(|c| c.column_name.clone()).collect(),
        macros.columns.iter().map(|c| c.column_name.clone()).collect(),
    );
    let assembler =
        FeatureAssembler::new(&store, &lineage, spec, &FeatureSettings::default()).unwrap();

    group.bench_function("1260_days_replay", |b| {
        b.iter(|| assembler.assemble(black_box("BBVA.MC"), Utc::now()).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_transforms, bench_rows, bench_scaler, bench_assemble);
criterion_main!(benches);
