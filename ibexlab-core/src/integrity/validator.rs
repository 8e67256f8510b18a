//! Integrity gate between raw snapshots and everything downstream.
//!
//! Checks, in order: duplicate dates, out-of-range values, calendar gaps.
//! The raw bars are never touched; repair (dedup, short-gap fill) produces a
//! new sequence that is only committed when the ticker does not FAIL.
//!
//! Gaps are measured against every trading day of the requested range, so
//! missing days before the first or after the last bar count too. Those edge
//! runs have no neighbour on one side and are never interpolated: a short one
//! is left open and warns, a long one fails like any other gap.

use super::fill::interpolate_gap;
use super::report::{
    GapRun, OutOfRange, RangeIssue, ValidatedPrices, ValidationReport, ValidationStatus,
};
use crate::config::ValidationConfig;
use crate::data::load_raw_snapshot;
use crate::domain::{Checksum, DateRange, PriceBar, PriceSeries, TradingCalendar};
use crate::error::PipelineError;
use crate::lineage::{LineageLog, LineageRecord, Stage, StageRun};
use crate::store::{ArtifactKey, ArtifactStore, WriteOutcome};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;

/// Relative slack on the adjustment factor for rounding in delivered quotes.
const FACTOR_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    calendar: TradingCalendar,
    config: ValidationConfig,
}

/// Report plus the repaired sequence (empty when the status is FAIL).
#[derive(Debug, Clone)]
pub struct Validation {
    pub report: ValidationReport,
    pub bars: Vec<PriceBar>,
}

impl IntegrityValidator {
    pub fn new(calendar: TradingCalendar, config: ValidationConfig) -> Self {
        Self { calendar, config }
    }

    pub fn validate(
        &self,
        ticker: &str,
        range: &DateRange,
        raw: &[PriceBar],
        raw_checksum: Checksum,
    ) -> Validation {
        let monotonic = raw.windows(2).all(|w| w[0].date < w[1].date);

        let mut sorted = raw.to_vec();
        sorted.sort_by_key(|b| b.date);

        let mut unique: Vec<PriceBar> = Vec::with_capacity(sorted.len());
        let mut duplicate_count = 0;
        let mut conflicting: Vec<NaiveDate> = Vec::new();
        for bar in sorted {
            if let Some(last) = unique.last() {
                if last.date == bar.date {
                    duplicate_count += 1;
                    if !last.same_quote(&bar) && conflicting.last() != Some(&bar.date) {
                        conflicting.push(bar.date);
                    }
                    continue;
                }
            }
            unique.push(bar);
        }

        let out_of_range = self.out_of_range(&unique);

        let off_calendar: Vec<NaiveDate> = unique
            .iter()
            .map(|b| b.date)
            .filter(|d| !self.calendar.is_trading_day(*d))
            .collect();
        if !off_calendar.is_empty() {
            log::warn!(
                "{ticker}: {} bars on non-trading days dropped",
                off_calendar.len()
            );
            unique.retain(|b| self.calendar.is_trading_day(b.date));
        }

        let date_range = match (unique.first(), unique.last()) {
            (Some(f), Some(l)) => DateRange::new(f.date, l.date),
            _ => None,
        };
        let mut gap_runs = self.gap_runs(&unique, range);

        let mut fail_reasons = Vec::new();
        if unique.is_empty() {
            fail_reasons.push("snapshot has no bars on trading days".to_string());
        }
        if !conflicting.is_empty() {
            fail_reasons.push(format!(
                "{} duplicate dates with conflicting quotes (first {})",
                conflicting.len(),
                conflicting[0]
            ));
        }
        if let Some(first) = out_of_range.first() {
            fail_reasons.push(format!(
                "{} out-of-range values (first {} {:?}: {})",
                out_of_range.len(),
                first.date,
                first.issue,
                first.detail
            ));
        }
        for run in gap_runs.iter().filter(|r| r.len() > self.config.max_fillable_gap) {
            fail_reasons.push(format!(
                "gap of {} trading days {}..={} exceeds {}",
                run.len(),
                run.dates[0],
                run.dates[run.len() - 1],
                self.config.max_fillable_gap
            ));
        }

        let mut bars = Vec::new();
        let mut filled_count = 0;
        if fail_reasons.is_empty() {
            let mut repaired = unique.clone();
            for run in gap_runs.iter_mut() {
                let before = unique.iter().rev().find(|b| b.date < run.dates[0]);
                let after = unique.iter().find(|b| b.date > run.dates[run.len() - 1]);
                if let (Some(before), Some(after)) = (before, after) {
                    repaired.extend(interpolate_gap(before, after, &run.dates));
                    filled_count += run.len();
                    run.filled = true;
                }
            }
            repaired.sort_by_key(|b| b.date);
            bars = repaired;
        }

        let status = if !fail_reasons.is_empty() {
            ValidationStatus::Fail
        } else if !gap_runs.is_empty() || duplicate_count > 0 || !off_calendar.is_empty() {
            ValidationStatus::Warn
        } else {
            ValidationStatus::Pass
        };

        let report = ValidationReport {
            ticker: ticker.to_string(),
            date_range,
            raw_checksum,
            rows: raw.len(),
            gap_dates: gap_runs.iter().flat_map(|r| r.dates.iter().copied()).collect(),
            gap_runs,
            duplicate_count,
            conflicting_duplicates: conflicting,
            out_of_range_count: out_of_range.len(),
            out_of_range,
            off_calendar,
            monotonic,
            filled_count,
            status,
            fail_reasons,
        };
        Validation { report, bars }
    }

    fn out_of_range(&self, bars: &[PriceBar]) -> Vec<OutOfRange> {
        let mut issues: Vec<OutOfRange> = bars.iter().filter_map(range_issue).collect();

        for w in bars.windows(2) {
            let (prev, cur) = (&w[0], &w[1]);
            if !(prev.close > 0.0 && cur.close.is_finite()) {
                continue;
            }
            let (f_prev, f_cur) = (prev.adjustment_factor(), cur.adjustment_factor());
            if f_prev > 0.0 && f_cur > 0.0 && f_cur < f_prev * (1.0 - FACTOR_TOLERANCE) {
                issues.push(OutOfRange {
                    date: cur.date,
                    issue: RangeIssue::AdjustmentReversal,
                    detail: format!("adjustment factor {f_prev:.6} -> {f_cur:.6}"),
                });
            }
            let change = cur.close / prev.close - 1.0;
            if change.abs() > self.config.shock_threshold {
                issues.push(OutOfRange {
                    date: cur.date,
                    issue: RangeIssue::Shock,
                    detail: format!(
                        "close {:.4} -> {:.4} ({:+.1}%)",
                        prev.close,
                        cur.close,
                        change * 100.0
                    ),
                });
            }
        }
        issues.sort_by_key(|i| i.date);
        issues
    }

    /// Runs of consecutive calendar trading days inside `range` with no bar.
    fn gap_runs(&self, bars: &[PriceBar], range: &DateRange) -> Vec<GapRun> {
        let present: BTreeSet<NaiveDate> = bars.iter().map(|b| b.date).collect();
        let mut runs = Vec::new();
        let mut current: Vec<NaiveDate> = Vec::new();
        for day in self.calendar.trading_days(range) {
            if present.contains(&day) {
                if !current.is_empty() {
                    runs.push(GapRun {
                        dates: std::mem::take(&mut current),
                        filled: false,
                    });
                }
            } else {
                current.push(day);
            }
        }
        if !current.is_empty() {
            runs.push(GapRun {
                dates: current,
                filled: false,
            });
        }
        runs
    }
}

fn range_issue(b: &PriceBar) -> Option<OutOfRange> {
    let issue = |issue: RangeIssue, detail: String| {
        Some(OutOfRange {
            date: b.date,
            issue,
            detail,
        })
    };
    let prices = [b.open, b.high, b.low, b.close, b.adjusted_close];
    if prices.iter().any(|p| !p.is_finite()) {
        return issue(RangeIssue::MissingValue, "non-finite price field".into());
    }
    if prices.iter().any(|p| *p <= 0.0) {
        return issue(RangeIssue::NonPositivePrice, format!("low {} close {}", b.low, b.close));
    }
    if b.high < b.low {
        return issue(RangeIssue::HighBelowLow, format!("high {} < low {}", b.high, b.low));
    }
    if b.open < b.low || b.open > b.high {
        return issue(
            RangeIssue::OpenOutsideRange,
            format!("open {} outside [{}, {}]", b.open, b.low, b.high),
        );
    }
    if b.close < b.low || b.close > b.high {
        return issue(
            RangeIssue::CloseOutsideRange,
            format!("close {} outside [{}, {}]", b.close, b.low, b.high),
        );
    }
    if b.volume < 0 {
        return issue(RangeIssue::NegativeVolume, format!("volume {}", b.volume));
    }
    None
}

/// Committed result of validating one ticker.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub report: ValidationReport,
    pub report_write: WriteOutcome,
    /// Present unless the ticker failed.
    pub validated_write: Option<WriteOutcome>,
    pub record: LineageRecord,
}

impl ValidationOutcome {
    /// `IntegrityFailure` if the report is FAIL.
    pub fn ensure_pass(&self) -> Result<(), PipelineError> {
        match self.report.failure_summary() {
            Some(reason) => Err(PipelineError::IntegrityFailure {
                ticker: self.report.ticker.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Serialize)]
struct ValidateParams<'a> {
    ticker: &'a str,
    range: &'a DateRange,
    validation: &'a ValidationConfig,
    calendar: &'a TradingCalendar,
}

/// Validate the committed raw snapshot of one ticker and commit the report
/// and, unless it failed, the repaired prices.
pub fn run_validation(
    validator: &IntegrityValidator,
    store: &ArtifactStore,
    lineage: &LineageLog,
    ticker: &str,
    range: &DateRange,
) -> Result<ValidationOutcome, PipelineError> {
    let raw_key = ArtifactKey::raw_snapshot(ticker, range);
    let (raw, raw_meta) = load_raw_snapshot(store, ticker, range)?;

    let Validation { report, bars } = validator.validate(ticker, range, &raw, raw_meta.checksum.clone());

    let report_key = ArtifactKey::validation_report(ticker, range);
    let report_write = store.put_json(&report_key, &report, Some(report.rows))?;

    let validated_write = if report.status.is_blocking() {
        None
    } else {
        let validated = ValidatedPrices {
            series: PriceSeries::new(ticker, bars),
            raw_checksum: raw_meta.checksum.clone(),
            status: report.status,
        };
        let key = ArtifactKey::validated_prices(ticker, range);
        Some(store.put_json(&key, &validated, Some(validated.series.len()))?)
    };

    let params = ValidateParams {
        ticker,
        range,
        validation: &validator.config,
        calendar: &validator.calendar,
    };
    let mut run = StageRun::new(Stage::Validate)
        .params(&params)?
        .input(raw_key.id(), raw_meta.checksum)
        .committed(&report_write)
        .rows("raw", report.rows)
        .rows("duplicates", report.duplicate_count)
        .rows("out_of_range", report.out_of_range_count)
        .rows("gap_days", report.gap_dates.len())
        .rows("filled", report.filled_count);
    if let Some(w) = &validated_write {
        run = run.committed(w);
    }
    if let Some(reason) = report.failure_summary() {
        run = run.halted(format!("{}: {reason}", report_key.id()));
    }
    let record = lineage.append(run)?;

    match report.status {
        ValidationStatus::Fail => log::warn!(
            "{ticker}: validation FAIL: {}",
            report.fail_reasons.join("; ")
        ),
        status => log::info!(
            "{ticker}: validation {status} ({} rows, {} filled, {} duplicates)",
            report.rows,
            report.filled_count,
            report.duplicate_count
        ),
    }

    Ok(ValidationOutcome {
        report,
        report_write,
        validated_write,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bar(date: &str, close: f64) -> PriceBar {
        PriceBar {
            ticker: "BBVA.MC".into(),
            date: d(date),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            adjusted_close: close,
            volume: 1_000,
            filled: false,
        }
    }

    fn validator() -> IntegrityValidator {
        IntegrityValidator::new(TradingCalendar::weekdays(), ValidationConfig::default())
    }

    fn span(start: &str, end: &str) -> DateRange {
        DateRange::new(d(start), d(end)).unwrap()
    }

    fn sum() -> Checksum {
        Checksum::of_bytes(b"raw")
    }

    #[test]
    fn clean_week_passes() {
        let bars: Vec<_> = ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05"]
            .iter()
            .enumerate()
            .map(|(i, d)| bar(d, 8.0 + i as f64 * 0.1))
            .collect();
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-05"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Pass);
        assert_eq!(v.bars.len(), 5);
        assert!(v.report.monotonic);
    }

    #[test]
    fn two_day_gap_is_filled_and_warns() {
        // Wed and Thu missing.
        let bars = vec![
            bar("2024-01-01", 8.0),
            bar("2024-01-02", 8.1),
            bar("2024-01-05", 8.4),
        ];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-05"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Warn);
        assert_eq!(v.report.gap_dates, vec![d("2024-01-03"), d("2024-01-04")]);
        assert_eq!(v.report.filled_count, 2);
        assert_eq!(v.bars.len(), 5);
        assert!(v.bars[2].filled && v.bars[3].filled);
        assert!((v.bars[2].close - 8.2).abs() < 1e-9);
        // Input untouched.
        assert_eq!(bars.len(), 3);
    }

    #[test]
    fn weekend_is_not_a_gap() {
        let bars = vec![bar("2024-01-05", 8.0), bar("2024-01-08", 8.1)];
        let v = validator().validate("BBVA.MC", &span("2024-01-05", "2024-01-08"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Pass);
        assert!(v.report.gap_dates.is_empty());
    }

    #[test]
    fn three_day_gap_fails() {
        let bars = vec![
            bar("2024-01-01", 8.0),
            bar("2024-01-02", 8.0),
            bar("2024-01-08", 8.1),
        ];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-08"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Fail);
        assert_eq!(v.report.gap_runs.len(), 1);
        assert_eq!(v.report.gap_runs[0].len(), 3);
        assert!(!v.report.gap_runs[0].filled);
        assert!(v.bars.is_empty());
    }

    #[test]
    fn exact_duplicates_collapse_with_warning() {
        let bars = vec![
            bar("2024-01-01", 8.0),
            bar("2024-01-02", 8.1),
            bar("2024-01-02", 8.1),
        ];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-02"), &bars, sum());
        assert_eq!(v.report.duplicate_count, 1);
        assert!(!v.report.monotonic);
        assert_eq!(v.report.status, ValidationStatus::Warn);
        assert_eq!(v.bars.len(), 2);
    }

    #[test]
    fn conflicting_duplicates_fail() {
        let bars = vec![bar("2024-01-01", 8.0), bar("2024-01-01", 8.3)];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-01"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Fail);
        assert_eq!(v.report.conflicting_duplicates, vec![d("2024-01-01")]);
    }

    #[test]
    fn structural_violations_are_out_of_range() {
        let mut inverted = bar("2024-01-02", 8.0);
        inverted.high = 7.0;
        let mut negative_volume = bar("2024-01-03", 8.0);
        negative_volume.volume = -5;
        let bars = vec![bar("2024-01-01", 8.0), inverted, negative_volume];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-03"), &bars, sum());
        assert_eq!(v.report.out_of_range_count, 2);
        assert_eq!(v.report.out_of_range[0].issue, RangeIssue::HighBelowLow);
        assert_eq!(v.report.out_of_range[1].issue, RangeIssue::NegativeVolume);
        assert_eq!(v.report.status, ValidationStatus::Fail);
    }

    #[test]
    fn shock_above_threshold_is_flagged() {
        let bars = vec![bar("2024-01-01", 8.0), bar("2024-01-02", 4.0)];
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-02"), &bars, sum());
        assert_eq!(v.report.out_of_range[0].issue, RangeIssue::Shock);

        let lenient = IntegrityValidator::new(
            TradingCalendar::weekdays(),
            ValidationConfig {
                shock_threshold: 0.6,
                ..ValidationConfig::default()
            },
        );
        let v = lenient.validate("BBVA.MC", &span("2024-01-01", "2024-01-02"), &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Pass);
    }

    #[test]
    fn holiday_is_not_a_gap_on_bme_calendar() {
        let v = IntegrityValidator::new(TradingCalendar::bme(), ValidationConfig::default());
        // 2024-05-01 is a BME closure.
        let bars = vec![bar("2024-04-30", 8.0), bar("2024-05-02", 8.1)];
        let out = v.validate("BBVA.MC", &span("2024-04-30", "2024-05-02"), &bars, sum());
        assert_eq!(out.report.status, ValidationStatus::Pass);
    }

    #[test]
    fn empty_snapshot_fails() {
        let v = validator().validate("BBVA.MC", &span("2024-01-01", "2024-01-05"), &[], sum());
        assert_eq!(v.report.status, ValidationStatus::Fail);
        assert!(v.report.date_range.is_none());
    }

    #[test]
    fn leading_gap_inside_range_fails() {
        // Feed starts on 2024-01-15; the ten weekdays before it are missing.
        let range = span("2024-01-01", "2024-01-19");
        let bars: Vec<_> = (15..=19)
            .map(|day| bar(&format!("2024-01-{day}"), 8.0))
            .collect();
        let v = validator().validate("BBVA.MC", &range, &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Fail);
        assert_eq!(v.report.gap_dates.len(), 10);
        assert_eq!(v.report.gap_dates[0], d("2024-01-01"));
        assert!(v.bars.is_empty());
    }

    #[test]
    fn short_edge_runs_warn_without_fill() {
        // Mon missing at the start, Fri missing at the end.
        let range = span("2024-01-01", "2024-01-05");
        let bars = vec![
            bar("2024-01-02", 8.0),
            bar("2024-01-03", 8.1),
            bar("2024-01-04", 8.2),
        ];
        let v = validator().validate("BBVA.MC", &range, &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Warn);
        assert_eq!(v.report.gap_dates, vec![d("2024-01-01"), d("2024-01-05")]);
        assert!(v.report.gap_runs.iter().all(|r| !r.filled));
        assert_eq!(v.report.filled_count, 0);
        assert_eq!(v.bars.len(), 3);
    }

    #[test]
    fn committed_snapshot_with_late_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("cache"));
        let lineage = LineageLog::new(dir.path().join("lineage.jsonl"));
        let range = span("2024-01-01", "2024-02-29");
        let bars: Vec<PriceBar> = TradingCalendar::weekdays()
            .trading_days(&range)
            .into_iter()
            .filter(|date| *date >= d("2024-01-15"))
            .map(|date| bar(&date.to_string(), 8.0))
            .collect();
        store
            .put_raw_bars(&ArtifactKey::raw_snapshot("BBVA.MC", &range), &bars)
            .unwrap();

        let out = run_validation(&validator(), &store, &lineage, "BBVA.MC", &range).unwrap();
        assert_eq!(out.report.status, ValidationStatus::Fail);
        assert_eq!(out.report.gap_dates.len(), 10);
        assert!(out.validated_write.is_none());
        assert!(out.ensure_pass().is_err());
    }

    #[test]
    fn falling_adjustment_factor_is_out_of_range() {
        let range = span("2024-01-01", "2024-01-03");
        let mut bars = vec![
            bar("2024-01-01", 8.0),
            bar("2024-01-02", 8.1),
            bar("2024-01-03", 8.2),
        ];
        // Dividend ex-date: earlier factors below later ones is consistent.
        bars[0].adjusted_close = 7.6;
        let v = validator().validate("BBVA.MC", &range, &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Pass);

        bars[2].adjusted_close = 7.9;
        let v = validator().validate("BBVA.MC", &range, &bars, sum());
        assert_eq!(v.report.status, ValidationStatus::Fail);
        assert_eq!(v.report.out_of_range.len(), 1);
        assert_eq!(v.report.out_of_range[0].issue, RangeIssue::AdjustmentReversal);
        assert_eq!(v.report.out_of_range[0].date, d("2024-01-03"));
    }
}
