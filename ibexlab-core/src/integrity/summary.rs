//! Batch summary export: one CSV row per validated ticker.

use super::report::ValidationReport;
use crate::domain::DateRange;
use crate::store::{ArtifactKey, ArtifactStore, StoreError, WriteOutcome};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    #[serde(rename = "Symbol")]
    symbol: &'a str,
    #[serde(rename = "Rows")]
    rows: usize,
    #[serde(rename = "Duplicates")]
    duplicates: usize,
    #[serde(rename = "OutOfRange")]
    out_of_range: usize,
    #[serde(rename = "GapDays")]
    gap_days: usize,
    #[serde(rename = "Filled")]
    filled: usize,
    #[serde(rename = "Date Min")]
    date_min: String,
    #[serde(rename = "Date Max")]
    date_max: String,
    #[serde(rename = "Monotonic Increasing")]
    monotonic: bool,
    #[serde(rename = "Status")]
    status: String,
}

pub fn summary_csv(reports: &[ValidationReport]) -> Result<Vec<u8>, StoreError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for r in reports {
        let row = SummaryRow {
            symbol: &r.ticker,
            rows: r.rows,
            duplicates: r.duplicate_count,
            out_of_range: r.out_of_range_count,
            gap_days: r.gap_dates.len(),
            filled: r.filled_count,
            date_min: r.date_range.map(|d| d.start.to_string()).unwrap_or_default(),
            date_max: r.date_range.map(|d| d.end.to_string()).unwrap_or_default(),
            monotonic: r.monotonic,
            status: r.status.to_string(),
        };
        wtr.serialize(row)
            .map_err(|e| StoreError::Csv(format!("row for {}: {e}", r.ticker)))?;
    }
    wtr.into_inner()
        .map_err(|e| StoreError::Csv(format!("flush: {e}")))
}

/// Commit the summary for a batch, sorted by ticker.
pub fn write_summary(
    store: &ArtifactStore,
    range: &DateRange,
    reports: &[ValidationReport],
) -> Result<WriteOutcome, StoreError> {
    let mut sorted: Vec<ValidationReport> = reports.to_vec();
    sorted.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    let bytes = summary_csv(&sorted)?;
    store.put_bytes(&ArtifactKey::validation_summary(range), &bytes, Some(sorted.len()))
}
