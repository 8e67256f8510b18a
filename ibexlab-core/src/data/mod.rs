//! Raw ingestion: providers, normalization, raw snapshots.

pub mod circuit_breaker;
pub mod csv_import;
pub mod ingest;
pub mod provider;
pub mod synthetic;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use csv_import::{parse_loose_csv, read_loose_csv, CsvProvider};
pub use ingest::{ingest_ticker, load_raw_snapshot, normalize_bars, IngestOutcome};
pub use provider::{DataError, DataProvider, DataSource, DownloadProgress, FetchResult, LogProgress};
pub use synthetic::SyntheticProvider;
pub use yahoo::YahooProvider;

use crate::config::{PipelineConfig, ProviderKind};
use std::sync::Arc;

/// Fetch-side failures once retries are exhausted.
pub type FetchError = DataError;

/// Build the provider selected in `[fetch]`.
pub fn provider_from_config(config: &PipelineConfig) -> Result<Box<dyn DataProvider>, DataError> {
    match config.fetch.provider {
        ProviderKind::Yahoo => Ok(Box::new(YahooProvider::new(
            &config.fetch,
            Arc::new(CircuitBreaker::from_config(&config.fetch)),
        )?)),
        ProviderKind::Csv => {
            let dir = config.io.raw_csv_dir.clone().ok_or_else(|| {
                DataError::Other("fetch.provider = \"csv\" requires io.raw_csv_dir".into())
            })?;
            Ok(Box::new(CsvProvider::new(dir)))
        }
        ProviderKind::Synthetic => Ok(Box::new(SyntheticProvider::new(
            config.fetch.seed,
            config.calendar.clone(),
        ))),
    }
}
