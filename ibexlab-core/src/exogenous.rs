//! Exogenous event builder.
//!
//! Turns the declarative event calendar into one binary column per category
//! over the trading days of a date range. A day is 1 if it falls inside any
//! window of the category; overlapping windows never sum past 1. Windows
//! reaching outside the range are clipped silently.

use crate::config::ConfigError;
use crate::domain::{Checksum, DateRange, TradingCalendar};
use crate::error::PipelineError;
use crate::lineage::{LineageLog, LineageRecord, Stage, StageRun};
use crate::store::{ArtifactKey, ArtifactStore, WriteOutcome};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named window of an exogenous event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventWindow {
    pub event_id: String,
    pub label: String,
    pub category: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl EventWindow {
    pub fn range(&self) -> Option<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// Collapse anything outside `[A-Za-z0-9_]` into single underscores.
pub fn sanitize_column(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let collapsed = out.split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_");
    if collapsed.is_empty() {
        "unnamed".to_string()
    } else {
        collapsed
    }
}

pub fn event_column_name(category: &str) -> String {
    format!("EVT_{}", sanitize_column(category))
}

/// Binary indicator for one category, aligned to trading days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventColumn {
    pub category: String,
    pub column_name: String,
    pub range: DateRange,
    pub dates: Vec<NaiveDate>,
    pub values: Vec<u8>,
}

impl EventColumn {
    /// Flag on `date`, `None` if the date is not in the column.
    pub fn value_on(&self, date: NaiveDate) -> Option<u8> {
        self.dates
            .binary_search(&date)
            .ok()
            .map(|i| self.values[i])
    }

    pub fn active_days(&self) -> usize {
        self.values.iter().filter(|v| **v == 1).count()
    }
}

/// Build one column per category, sorted by column name.
pub fn build_event_columns(
    windows: &[EventWindow],
    range: &DateRange,
    calendar: &TradingCalendar,
) -> Result<Vec<EventColumn>, PipelineError> {
    let mut by_category: BTreeMap<String, Vec<DateRange>> = BTreeMap::new();
    for w in windows {
        let window = w.range().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "event '{}' starts {} after it ends {}",
                w.event_id, w.start_date, w.end_date
            ))
        })?;
        let spans = by_category.entry(w.category.clone()).or_default();
        if let Some(clipped) = window.clip(range) {
            spans.push(clipped);
        }
    }

    let dates = calendar.trading_days(range);
    let mut columns: Vec<EventColumn> = by_category
        .into_iter()
        .map(|(category, spans)| {
            let values = dates
                .iter()
                .map(|d| u8::from(spans.iter().any(|s| s.contains(*d))))
                .collect();
            EventColumn {
                column_name: event_column_name(&category),
                category,
                range: *range,
                dates: dates.clone(),
                values,
            }
        })
        .collect();
    columns.sort_by(|a, b| a.column_name.cmp(&b.column_name));
    Ok(columns)
}

#[derive(Debug, Clone)]
pub struct EventBuildOutcome {
    pub columns: Vec<EventColumn>,
    pub writes: Vec<WriteOutcome>,
    pub record: LineageRecord,
}

#[derive(Serialize)]
struct EventParams<'a> {
    range: &'a DateRange,
    calendar: &'a TradingCalendar,
}

/// Build and commit every event column for `range`.
pub fn run_event_builder(
    windows: &[EventWindow],
    calendar: &TradingCalendar,
    range: &DateRange,
    store: &ArtifactStore,
    lineage: &LineageLog,
) -> Result<EventBuildOutcome, PipelineError> {
    let columns = build_event_columns(windows, range, calendar)?;

    let mut run = StageRun::new(Stage::BuildEvents)
        .params(&EventParams { range, calendar })?
        .input("config/events", Checksum::of_json(&windows)?);
    let mut writes = Vec::with_capacity(columns.len());
    for col in &columns {
        let key = ArtifactKey::event_column(&col.column_name, range);
        let write = store.put_json(&key, col, Some(col.values.len()))?;
        run = run.committed(&write).rows(col.column_name.clone(), col.active_days());
        writes.push(write);
    }
    let record = lineage.append(run)?;

    log::info!(
        "built {} event columns over {} trading days",
        columns.len(),
        columns.first().map(|c| c.dates.len()).unwrap_or(0)
    );
    Ok(EventBuildOutcome {
        columns,
        writes,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn window(id: &str, category: &str, start: &str, end: &str) -> EventWindow {
        EventWindow {
            event_id: id.into(),
            label: id.into(),
            category: category.into(),
            start_date: d(start),
            end_date: d(end),
        }
    }

    #[test]
    fn overlapping_windows_union_to_one() {
        let range = DateRange::new(d("2024-01-01"), d("2024-01-12")).unwrap();
        let windows = vec![
            window("a", "crisis", "2024-01-02", "2024-01-04"),
            window("b", "crisis", "2024-01-03", "2024-01-08"),
        ];
        let cols = build_event_columns(&windows, &range, &TradingCalendar::weekdays()).unwrap();
        assert_eq!(cols.len(), 1);
        let col = &cols[0];
        assert_eq!(col.column_name, "EVT_crisis");
        assert!(col.values.iter().all(|v| *v <= 1));
        assert_eq!(col.value_on(d("2024-01-01")), Some(0));
        assert_eq!(col.value_on(d("2024-01-03")), Some(1));
        assert_eq!(col.value_on(d("2024-01-08")), Some(1));
        assert_eq!(col.value_on(d("2024-01-09")), Some(0));
        // Jan 2-5 and Jan 8.
        assert_eq!(col.active_days(), 5);
    }

    #[test]
    fn windows_outside_range_are_clipped() {
        let range = DateRange::new(d("2024-01-08"), d("2024-01-12")).unwrap();
        let windows = vec![
            window("early", "election", "2023-12-01", "2024-01-09"),
            window("gone", "election", "2023-01-01", "2023-02-01"),
        ];
        let cols = build_event_columns(&windows, &range, &TradingCalendar::weekdays()).unwrap();
        assert_eq!(cols[0].values, vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn category_without_days_in_range_is_all_zero() {
        let range = DateRange::new(d("2024-01-08"), d("2024-01-12")).unwrap();
        let windows = vec![window("old", "pandemic", "2020-03-01", "2020-06-01")];
        let cols = build_event_columns(&windows, &range, &TradingCalendar::weekdays()).unwrap();
        assert_eq!(cols[0].values, vec![0; 5]);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(event_column_name("ECB rate hike!"), "EVT_ECB_rate_hike");
        assert_eq!(sanitize_column("  a--b  c "), "a_b_c");
        assert_eq!(sanitize_column("%%"), "unnamed");
    }

    #[test]
    fn weekend_dates_are_absent() {
        let range = DateRange::new(d("2024-01-05"), d("2024-01-08")).unwrap();
        let cols = build_event_columns(
            &[window("x", "crisis", "2024-01-01", "2024-01-31")],
            &range,
            &TradingCalendar::weekdays(),
        )
        .unwrap();
        assert_eq!(cols[0].value_on(d("2024-01-06")), None);
        assert_eq!(cols[0].dates.len(), 2);
    }

    #[test]
    fn run_commits_columns_and_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("cache"));
        let lineage = LineageLog::new(dir.path().join("lineage.jsonl"));
        let range = DateRange::new(d("2024-01-01"), d("2024-01-31")).unwrap();
        let windows = vec![
            window("a", "crisis", "2024-01-02", "2024-01-04"),
            window("b", "election", "2024-01-10", "2024-01-10"),
        ];
        let out = run_event_builder(&windows, &TradingCalendar::weekdays(), &range, &store, &lineage)
            .unwrap();
        assert_eq!(out.writes.len(), 2);
        let loaded: EventColumn = store
            .get_json(&ArtifactKey::event_column("EVT_crisis", &range))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, out.columns[0]);
        assert_eq!(out.record.output_checksums.len(), 2);
    }
}
