//! Loose OHLCV CSV import.
//!
//! Accepts the exports people actually have lying around: padded header names,
//! a second header row carrying ticker names, timestamps instead of dates, a
//! missing `Adj Close` column. Rows whose date does not parse or whose close is
//! missing are skipped. Output is sorted by date (stable).

use super::provider::{DataError, DataProvider, DataSource, FetchResult};
use crate::domain::{file_stem_for, DateRange, PriceBar};
use chrono::NaiveDate;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Reads `{dir}/{file stem}.csv` for each symbol.
pub struct CsvProvider {
    dir: PathBuf,
}

impl CsvProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", file_stem_for(symbol)))
    }
}

impl DataProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv_import"
    }

    fn fetch(&self, symbol: &str, _range: &DateRange) -> Result<FetchResult, DataError> {
        let path = self.path_for(symbol);
        if !path.exists() {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        }
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars: read_loose_csv(&path, symbol)?,
            source: DataSource::CsvImport,
        })
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }
}

pub fn read_loose_csv(path: &Path, ticker: &str) -> Result<Vec<PriceBar>, DataError> {
    let file = std::fs::File::open(path)?;
    parse_loose_csv(file, ticker, &path.display().to_string())
}

struct Columns {
    date: usize,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: usize,
    adj_close: Option<usize>,
    volume: Option<usize>,
}

/// Parse a loose CSV stream. `source_name` is only used in error messages.
pub fn parse_loose_csv<R: Read>(
    reader: R,
    ticker: &str,
    source_name: &str,
) -> Result<Vec<PriceBar>, DataError> {
    let malformed = |reason: String| DataError::Malformed {
        source_name: source_name.to_string(),
        reason,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| malformed(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let cols = Columns {
        date: find("Date").ok_or_else(|| malformed("missing 'Date' column".into()))?,
        open: find("Open"),
        high: find("High"),
        low: find("Low"),
        close: find("Close").ok_or_else(|| malformed("missing 'Close' column".into()))?,
        adj_close: find("Adj Close").or_else(|| find("Adj_Close")),
        volume: find("Volume"),
    };

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for record in rdr.records() {
        let record = record.map_err(|e| malformed(e.to_string()))?;
        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).map(str::trim);
        let num = |idx: Option<usize>| {
            field(idx)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(f64::NAN)
        };

        let Some(date) = field(Some(cols.date)).and_then(parse_date) else {
            skipped += 1;
            continue;
        };
        let close = num(Some(cols.close));
        if close.is_nan() {
            skipped += 1;
            continue;
        }
        let adj = num(cols.adj_close);

        bars.push(PriceBar {
            ticker: ticker.to_string(),
            date,
            open: num(cols.open),
            high: num(cols.high),
            low: num(cols.low),
            close,
            adjusted_close: if adj.is_nan() { close } else { adj },
            volume: field(cols.volume)
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .map(|v| v as i64)
                .unwrap_or(0),
            filled: false,
        });
    }

    if skipped > 0 {
        log::debug!("{source_name}: skipped {skipped} rows without a date or close");
    }
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

/// `2024-01-02`, `2024-01-02 00:00:00+01:00`, `2024/01/02`.
fn parse_date(s: &str) -> Option<NaiveDate> {
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y/%m/%d"))
        .ok()
}
