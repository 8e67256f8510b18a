//! Raw price snapshots as Parquet.
//!
//! Schema: `date` (Date), `open`/`high`/`low`/`close`/`adj_close` (f64),
//! `volume` (i64). The ticker is carried by the artifact key, not a column.

use super::artifact::{ArtifactKey, ArtifactStore, StoreError, WriteOutcome};
use crate::domain::PriceBar;
use chrono::NaiveDate;
use polars::prelude::*;
use std::io::Cursor;

const EXPECTED_COLUMNS: [&str; 7] = ["date", "open", "high", "low", "close", "adj_close", "volume"];

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

impl ArtifactStore {
    /// Commit a raw snapshot. Bars are written in the given order.
    pub fn put_raw_bars(
        &self,
        key: &ArtifactKey,
        bars: &[PriceBar],
    ) -> Result<WriteOutcome, StoreError> {
        if bars.is_empty() {
            return Err(StoreError::Parquet("no bars to write".into()));
        }
        let bytes = bars_to_parquet(bars)?;
        self.put_bytes(key, &bytes, Some(bars.len()))
    }

    /// Load a raw snapshot for `ticker`, or `None` if it was never committed.
    pub fn get_raw_bars(
        &self,
        key: &ArtifactKey,
        ticker: &str,
    ) -> Result<Option<Vec<PriceBar>>, StoreError> {
        match self.get_bytes(key)? {
            Some(bytes) => parquet_to_bars(&bytes, ticker).map(Some),
            None => Ok(None),
        }
    }
}

/// Encode bars to an in-memory Parquet file.
pub fn bars_to_parquet(bars: &[PriceBar]) -> Result<Vec<u8>, StoreError> {
    let epoch = epoch();
    let dates: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch).num_days() as i32)
        .collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let adj_closes: Vec<f64> = bars.iter().map(|b| b.adjusted_close).collect();
    let volumes: Vec<i64> = bars.iter().map(|b| b.volume).collect();

    let mut df = DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| StoreError::Parquet(format!("date cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("adj_close".into(), adj_closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))?;

    let mut buf: Vec<u8> = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(&mut df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(buf)
}

/// Decode a Parquet snapshot produced by [`bars_to_parquet`].
pub fn parquet_to_bars(bytes: &[u8], ticker: &str) -> Result<Vec<PriceBar>, StoreError> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read: {e}")))?;

    for name in EXPECTED_COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Parquet(format!("missing column '{name}'")));
        }
    }

    let col_err = |e: PolarsError| StoreError::Parquet(format!("column read: {e}"));
    let date_ca = df.column("date").map_err(col_err)?.date().map_err(col_err)?;
    let open_ca = df.column("open").map_err(col_err)?.f64().map_err(col_err)?;
    let high_ca = df.column("high").map_err(col_err)?.f64().map_err(col_err)?;
    let low_ca = df.column("low").map_err(col_err)?.f64().map_err(col_err)?;
    let close_ca = df.column("close").map_err(col_err)?.f64().map_err(col_err)?;
    let adj_ca = df.column("adj_close").map_err(col_err)?.f64().map_err(col_err)?;
    let vol_ca = df.column("volume").map_err(col_err)?.i64().map_err(col_err)?;

    let epoch = epoch();
    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let days = date_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null date at row {i}")))?;
        bars.push(PriceBar {
            ticker: ticker.to_string(),
            date: epoch + chrono::Duration::days(days as i64),
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            adjusted_close: adj_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0),
            filled: false,
        });
    }
    Ok(bars)
}
