//! Raw ingestion: fetch, normalize, commit an immutable snapshot.
//!
//! Normalization only cleans what cannot be represented downstream: bars
//! outside the requested range, bars without a close, a missing adjusted
//! close. Ordering problems and duplicates are kept as delivered so the
//! integrity validator can see and report them.

use super::provider::DataProvider;
use crate::domain::{file_stem_for, Checksum, DateRange, PriceBar};
use crate::error::PipelineError;
use crate::lineage::{LineageLog, LineageRecord, Stage, StageRun};
use crate::store::{ArtifactKey, ArtifactMeta, ArtifactStore, WriteOutcome};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct IngestParams<'a> {
    ticker: &'a str,
    range: &'a DateRange,
    provider: &'a str,
    interval: &'a str,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub ticker: String,
    pub key: ArtifactKey,
    pub write: WriteOutcome,
    pub rows: usize,
    /// Bars discarded by normalization.
    pub discarded: usize,
    pub record: LineageRecord,
}

/// Clip to `range`, drop bars without a close, default the adjusted close to
/// the close, and stable-sort by date. Returns the bars and the discard count.
pub fn normalize_bars(ticker: &str, bars: Vec<PriceBar>, range: &DateRange) -> (Vec<PriceBar>, usize) {
    let total = bars.len();
    let mut kept: Vec<PriceBar> = bars
        .into_iter()
        .filter(|b| range.contains(b.date) && b.close.is_finite())
        .map(|mut b| {
            b.ticker = ticker.to_string();
            if !b.adjusted_close.is_finite() {
                b.adjusted_close = b.close;
            }
            b
        })
        .collect();
    kept.sort_by_key(|b| b.date);
    let discarded = total - kept.len();
    (kept, discarded)
}

/// Fetch one ticker and commit its raw snapshot.
pub fn ingest_ticker(
    provider: &dyn DataProvider,
    store: &ArtifactStore,
    lineage: &LineageLog,
    ticker: &str,
    range: &DateRange,
) -> Result<IngestOutcome, PipelineError> {
    let fetched = provider
        .fetch(ticker, range)
        .map_err(|source| PipelineError::Fetch {
            ticker: ticker.to_string(),
            source,
        })?;
    let source_checksum = Checksum::of_json(&fetched.bars)?;

    let (bars, discarded) = normalize_bars(ticker, fetched.bars, range);
    if bars.is_empty() {
        return Err(PipelineError::Fetch {
            ticker: ticker.to_string(),
            source: super::DataError::EmptyRange {
                symbol: ticker.to_string(),
                range: *range,
            },
        });
    }
    if discarded > 0 {
        log::warn!("{ticker}: discarded {discarded} bars outside range or without close");
    }

    let key = ArtifactKey::raw_snapshot(ticker, range);
    let write = store.put_raw_bars(&key, &bars)?;

    let params = IngestParams {
        ticker,
        range,
        provider: provider.name(),
        interval: "1d",
    };
    let record = lineage.append(
        StageRun::new(Stage::Ingest)
            .params(&params)?
            .input(
                format!("source/{}/{}", provider.name(), file_stem_for(ticker)),
                source_checksum,
            )
            .committed(&write)
            .rows("bars", bars.len())
            .rows("discarded", discarded),
    )?;

    log::info!(
        "{ticker}: {} bars ingested from {} ({})",
        bars.len(),
        provider.name(),
        if write.unchanged { "unchanged" } else { "new snapshot" }
    );

    Ok(IngestOutcome {
        ticker: ticker.to_string(),
        key,
        rows: bars.len(),
        discarded,
        write,
        record,
    })
}

/// Load a committed raw snapshot with its meta.
pub fn load_raw_snapshot(
    store: &ArtifactStore,
    ticker: &str,
    range: &DateRange,
) -> Result<(Vec<PriceBar>, ArtifactMeta), PipelineError> {
    let key = ArtifactKey::raw_snapshot(ticker, range);
    let meta = store
        .meta(&key)?
        .ok_or_else(|| PipelineError::incomplete(key.id(), "raw snapshot not ingested"))?;
    let bars = store
        .get_raw_bars(&key, ticker)?
        .ok_or_else(|| PipelineError::incomplete(key.id(), "raw snapshot payload missing"))?;
    Ok((bars, meta))
}
