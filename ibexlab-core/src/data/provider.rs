//! Quote sources and the fetch error family.
//!
//! Ingestion only sees [`DataProvider`]: Yahoo's chart API, a directory of
//! loose CSV exports, or the seeded generator used offline.

use crate::domain::{DateRange, PriceBar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a ticker could not be fetched. Providers retry internally; whatever
/// reaches the caller halts that ticker's ingestion.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("unexpected provider payload: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("provider is blocking requests; circuit breaker open")]
    CircuitBreakerTripped,

    #[error("malformed source {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },

    #[error("no data for '{symbol}' in {range}")]
    EmptyRange { symbol: String, range: DateRange },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data error: {0}")]
    Other(String),
}

/// Bars for one symbol, as delivered.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub bars: Vec<PriceBar>,
    pub source: DataSource,
}

/// Recorded with each raw snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    YahooFinance,
    CsvImport,
    Synthetic,
}

/// Daily OHLCV source.
///
/// Bars may come back unsorted, duplicated or with NaN fields;
/// [`super::ingest`] normalizes them before anything is stored.
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Daily bars for `symbol` over the inclusive `range`.
    fn fetch(&self, symbol: &str, range: &DateRange) -> Result<FetchResult, DataError>;

    /// False while the provider refuses requests (breaker open).
    fn is_available(&self) -> bool;
}

/// Callbacks from a multi-symbol download, invoked from worker threads.
pub trait DownloadProgress: Send + Sync {
    fn on_start(&self, symbol: &str, index: usize, total: usize);

    fn on_complete(&self, symbol: &str, index: usize, total: usize, result: &Result<(), String>);

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Reports download progress as log lines.
pub struct LogProgress;

impl DownloadProgress for LogProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize) {
        log::info!("fetch {symbol} ({}/{total})", index + 1);
    }

    fn on_complete(&self, symbol: &str, _index: usize, _total: usize, result: &Result<(), String>) {
        match result {
            Ok(()) => log::info!("{symbol}: raw snapshot committed"),
            Err(e) => log::warn!("{symbol}: fetch failed: {e}"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        if failed == 0 {
            log::info!("fetched {succeeded} of {total} symbols");
        } else {
            log::warn!("fetched {succeeded} of {total} symbols, {failed} failed");
        }
    }
}
