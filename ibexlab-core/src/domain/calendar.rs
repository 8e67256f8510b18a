//! Date ranges and the reference exchange calendar.
//!
//! The validator measures gaps against this calendar, so a date is a "missing
//! trading day" only if the exchange was open on it.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Inclusive date interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` if `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Intersection with `other`, `None` when disjoint.
    pub fn clip(&self, other: &DateRange) -> Option<DateRange> {
        DateRange::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Path-safe key: `2000-01-03_2024-12-31`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }

    /// Every calendar day in the range.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start
            .iter_days()
            .take_while(move |d| *d <= self.end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Which base holiday rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// Monday to Friday, no holidays.
    Weekdays,
    /// Bolsa de Madrid: weekdays minus the TARGET2 closing days.
    #[default]
    Bme,
}

/// Reference exchange calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradingCalendar {
    pub kind: CalendarKind,
    /// Additional ad-hoc closures (exchange outages, one-off holidays).
    #[serde(default)]
    pub extra_closures: BTreeSet<NaiveDate>,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::bme()
    }
}

impl TradingCalendar {
    pub fn bme() -> Self {
        Self {
            kind: CalendarKind::Bme,
            extra_closures: BTreeSet::new(),
        }
    }

    pub fn weekdays() -> Self {
        Self {
            kind: CalendarKind::Weekdays,
            extra_closures: BTreeSet::new(),
        }
    }

    pub fn with_closures(mut self, closures: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.extra_closures.extend(closures);
        self
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if self.extra_closures.contains(&date) {
            return false;
        }
        match self.kind {
            CalendarKind::Weekdays => true,
            CalendarKind::Bme => !is_bme_holiday(date),
        }
    }

    /// All trading days in `range`, ascending.
    pub fn trading_days(&self, range: &DateRange) -> Vec<NaiveDate> {
        range.days().filter(|d| self.is_trading_day(*d)).collect()
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_day(d) {
            d += Duration::days(1);
        }
        d
    }
}

/// TARGET2 closing days observed by the Spanish exchange.
fn is_bme_holiday(date: NaiveDate) -> bool {
    let (m, d) = (date.month(), date.day());
    if (m, d) == (1, 1) || (m, d) == (5, 1) || (m, d) == (12, 25) || (m, d) == (12, 26) {
        return true;
    }
    let easter = easter_sunday(date.year());
    date == easter - Duration::days(2) || date == easter + Duration::days(1)
}

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
pub fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    // month is always 3 or 4 and day within range for any year.
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap_or(NaiveDate::MIN)
}
