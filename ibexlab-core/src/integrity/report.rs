//! Validation report types.

use crate::domain::{Checksum, DateRange, PriceSeries};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pass,
    /// Passed after short gaps were filled or exact duplicates collapsed.
    Warn,
    /// Blocks every downstream stage for the ticker.
    Fail,
}

impl ValidationStatus {
    pub fn is_blocking(&self) -> bool {
        matches!(self, ValidationStatus::Fail)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationStatus::Pass => "PASS",
            ValidationStatus::Warn => "WARN",
            ValidationStatus::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeIssue {
    /// A price field is NaN or infinite.
    MissingValue,
    HighBelowLow,
    OpenOutsideRange,
    CloseOutsideRange,
    NonPositivePrice,
    NegativeVolume,
    /// Close-to-close move above the shock threshold.
    Shock,
    /// `adjusted_close / close` fell from one bar to the next. Back-adjusted
    /// factors only rise toward 1 as split and dividend dates pass.
    AdjustmentReversal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfRange {
    pub date: NaiveDate,
    pub issue: RangeIssue,
    pub detail: String,
}

/// Consecutive missing trading days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRun {
    pub dates: Vec<NaiveDate>,
    pub filled: bool,
}

impl GapRun {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ticker: String,
    /// First and last observed date; `None` for an empty snapshot.
    pub date_range: Option<DateRange>,
    /// Checksum of the raw snapshot this report describes.
    pub raw_checksum: Checksum,
    pub rows: usize,
    pub gap_dates: Vec<NaiveDate>,
    pub gap_runs: Vec<GapRun>,
    /// Extra rows sharing a date with an earlier row.
    pub duplicate_count: usize,
    /// Duplicate dates whose quotes disagree.
    pub conflicting_duplicates: Vec<NaiveDate>,
    pub out_of_range_count: usize,
    pub out_of_range: Vec<OutOfRange>,
    /// Bars on dates the reference calendar marks closed.
    pub off_calendar: Vec<NaiveDate>,
    /// Dates were strictly increasing in the snapshot as delivered.
    pub monotonic: bool,
    pub filled_count: usize,
    pub status: ValidationStatus,
    pub fail_reasons: Vec<String>,
}

impl ValidationReport {
    /// One-line description of why the ticker failed, if it did.
    pub fn failure_summary(&self) -> Option<String> {
        (self.status == ValidationStatus::Fail).then(|| self.fail_reasons.join("; "))
    }
}

/// Validated (deduplicated, gap-filled) prices plus the raw snapshot they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedPrices {
    pub series: PriceSeries,
    pub raw_checksum: Checksum,
    pub status: ValidationStatus,
}
