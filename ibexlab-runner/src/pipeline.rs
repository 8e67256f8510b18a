//! End-to-end orchestration.
//!
//! Tickers are independent, so ingestion, validation, assembly and
//! evaluation fan out across rayon workers. The event builder and macro
//! aggregator share no state and run side by side with `rayon::join`.
//!
//! A ticker-level failure halts only that ticker and becomes a
//! [`HaltReport`]; failures that affect every ticker (config, shared event
//! or macro sources) abort the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ibexlab_core::data::{ingest_ticker, DataError, DataProvider, DownloadProgress, IngestOutcome};
use ibexlab_core::domain::DateRange;
use ibexlab_core::exogenous::{run_event_builder, EventBuildOutcome};
use ibexlab_core::features::{AssemblyOutcome, FeatureAssembler};
use ibexlab_core::integrity::{run_validation, write_summary, IntegrityValidator, ValidationOutcome};
use ibexlab_core::lineage::{LineageLog, Stage};
use ibexlab_core::macro_series::{self, run_macro_aggregator, MacroAggregateOutcome};
use ibexlab_core::store::{ArtifactKey, ArtifactStore};
use ibexlab_core::{PipelineConfig, PipelineError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::evaluation::{evaluate_ticker, EvaluationOutcome};
use crate::outcome::{find_assembly_halt, CompletedTicker, HaltReport, PipelineReport, TickerOutcome};

/// Options for the download step.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Re-fetch even when a raw snapshot for the range is already committed.
    pub force: bool,
}

pub struct Pipeline {
    config: PipelineConfig,
    base_dir: PathBuf,
    store: ArtifactStore,
    lineage: LineageLog,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl Pipeline {
    /// Relative paths in `config` are resolved against `base_dir`.
    pub fn new(config: PipelineConfig, base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let store = ArtifactStore::new(resolve(&base_dir, &config.io.cache_dir));
        let lineage = LineageLog::new(resolve(&base_dir, &config.io.lineage_path));
        Self {
            config,
            base_dir,
            store,
            lineage,
        }
    }

    /// Load the config at `path`; relative paths resolve against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::new(config, base))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn lineage(&self) -> &LineageLog {
        &self.lineage
    }

    pub fn range(&self) -> DateRange {
        self.config.dates.full_range()
    }

    /// Forecast targets. References are ingested and validated only.
    pub fn targets(&self) -> Vec<String> {
        self.config
            .universe
            .targets
            .iter()
            .map(|a| a.symbol.clone())
            .collect()
    }

    pub fn assembler(&self) -> Result<FeatureAssembler<'_>, PipelineError> {
        FeatureAssembler::from_config(&self.store, &self.lineage, &self.config)
    }

    pub fn download(
        &self,
        provider: &dyn DataProvider,
        progress: &dyn DownloadProgress,
        symbols: &[String],
        opts: DownloadOptions,
    ) -> Vec<(String, Result<Option<IngestOutcome>, PipelineError>)> {
        let range = self.range();
        let total = symbols.len();
        let results: Vec<_> = symbols
            .par_iter()
            .enumerate()
            .map(|(i, symbol)| {
                if !opts.force && self.store.exists(&ArtifactKey::raw_snapshot(symbol, &range)) {
                    log::info!("{symbol}: raw snapshot for {range} already committed");
                    return (symbol.clone(), Ok(None));
                }
                if !provider.is_available() {
                    let err = PipelineError::Fetch {
                        ticker: symbol.clone(),
                        source: DataError::CircuitBreakerTripped,
                    };
                    progress.on_complete(symbol, i, total, &Err(err.to_string()));
                    return (symbol.clone(), Err(err));
                }
                progress.on_start(symbol, i, total);
                let result = ingest_ticker(provider, &self.store, &self.lineage, symbol, &range);
                let status = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                progress.on_complete(symbol, i, total, &status);
                (symbol.clone(), result.map(Some))
            })
            .collect();

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        progress.on_batch_complete(total - failed, failed, total);
        results
    }

    /// Validate each symbol and export the summary CSV.
    pub fn validate(
        &self,
        symbols: &[String],
    ) -> Result<Vec<(String, Result<ValidationOutcome, PipelineError>)>> {
        let range = self.range();
        let validator =
            IntegrityValidator::new(self.config.calendar.clone(), self.config.validation.clone());
        let results: Vec<_> = symbols
            .par_iter()
            .map(|symbol| {
                let outcome = run_validation(&validator, &self.store, &self.lineage, symbol, &range);
                (symbol.clone(), outcome)
            })
            .collect();

        let reports: Vec<_> = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().map(|o| o.report.clone()))
            .collect();
        if !reports.is_empty() {
            write_summary(&self.store, &range, &reports)
                .context("failed to write validation summary")?;
        }
        Ok(results)
    }

    /// Event columns and macro columns, built concurrently.
    pub fn build_sources(&self) -> Result<(EventBuildOutcome, MacroAggregateOutcome)> {
        let range = self.range();
        let calendar = &self.config.calendar;
        let (events, macros) = rayon::join(
            || run_event_builder(&self.config.events, calendar, &range, &self.store, &self.lineage),
            || -> Result<MacroAggregateOutcome, PipelineError> {
                let inputs = macro_series::load_sources(&self.config.macro_sources, &self.base_dir)?;
                run_macro_aggregator(&inputs, calendar, &range, &self.store, &self.lineage)
            },
        );
        let events = events.context("event builder failed")?;
        let macros = macros.context("macro aggregator failed")?;
        Ok((events, macros))
    }

    pub fn build_features(
        &self,
        tickers: &[String],
        as_of: DateTime<Utc>,
    ) -> Result<Vec<(String, Result<AssemblyOutcome, PipelineError>)>> {
        let assembler = self.assembler().context("failed to hash feature config")?;
        Ok(tickers
            .par_iter()
            .map(|t| (t.clone(), assembler.assemble(t, as_of)))
            .collect())
    }

    pub fn evaluate(
        &self,
        tickers: &[String],
    ) -> Result<Vec<(String, Result<EvaluationOutcome, PipelineError>)>> {
        let assembler = self.assembler().context("failed to hash feature config")?;
        Ok(tickers
            .par_iter()
            .map(|t| (t.clone(), evaluate_ticker(&assembler, t, &self.config.evaluation)))
            .collect())
    }

    /// Ingest, validate, build sources and assemble features for the whole
    /// universe. Tickers that fail a stage are reported, not retried.
    pub fn run(
        &self,
        provider: &dyn DataProvider,
        progress: &dyn DownloadProgress,
        opts: DownloadOptions,
        as_of: DateTime<Utc>,
    ) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let range = self.range();
        let symbols = self.config.universe.all_symbols();
        let mut outcomes: Vec<TickerOutcome> = Vec::new();

        let mut ingested = Vec::new();
        for (symbol, result) in self.download(provider, progress, &symbols, opts) {
            match result {
                Ok(_) => ingested.push(symbol),
                Err(e) => {
                    log::warn!("{symbol}: halted at ingest: {e}");
                    outcomes.push(TickerOutcome::Halted(HaltReport::new(
                        &self.lineage,
                        &symbol,
                        Stage::Ingest,
                        &e,
                        None,
                        None,
                    )));
                }
            }
        }

        let mut validation = Vec::new();
        let mut passed = Vec::new();
        for (symbol, result) in self.validate(&ingested)? {
            let raw_key = ArtifactKey::raw_snapshot(&symbol, &range);
            let halt = match result {
                Ok(outcome) => {
                    let gate = outcome.ensure_pass();
                    validation.push(outcome.report.clone());
                    match gate {
                        Ok(()) => {
                            passed.push((symbol, outcome.report.rows));
                            continue;
                        }
                        Err(e) => (e, Some(outcome.record)),
                    }
                }
                Err(e) => (e, None),
            };
            log::warn!("{symbol}: halted at validation: {}", halt.0);
            outcomes.push(TickerOutcome::Halted(HaltReport::new(
                &self.lineage,
                &symbol,
                Stage::Validate,
                &halt.0,
                halt.1,
                Some(&raw_key),
            )));
        }

        let (events, macros) = self.build_sources()?;
        let event_columns = events.columns.iter().map(|c| c.column_name.clone()).collect();
        let macro_columns = macros.columns.iter().map(|c| c.column_name.clone()).collect();

        let targets = self.targets();
        let mut assemble = Vec::new();
        for (symbol, rows) in passed {
            if targets.contains(&symbol) {
                assemble.push(symbol);
            } else {
                outcomes.push(TickerOutcome::Completed(CompletedTicker {
                    snapshot_key: ArtifactKey::validated_prices(&symbol, &range).id(),
                    ticker: symbol,
                    rows,
                    dropped: 0,
                }));
            }
        }

        let assembler = self.assembler()?;
        for (ticker, result) in self.build_features(&assemble, as_of)? {
            match result {
                Ok(out) => outcomes.push(TickerOutcome::Completed(CompletedTicker {
                    snapshot_key: out.snapshot_write.key.clone(),
                    rows: out.snapshot.rows.len(),
                    dropped: out.snapshot.drops.len(),
                    ticker,
                })),
                Err(e) => {
                    log::warn!("{ticker}: halted at feature assembly: {e}");
                    let record = match e {
                        PipelineError::DropRateExceeded { .. } => {
                            find_assembly_halt(&self.lineage, &ticker)
                        }
                        _ => None,
                    };
                    let upstream = ArtifactKey::validation_report(&ticker, &range);
                    outcomes.push(TickerOutcome::Halted(HaltReport::new(
                        &self.lineage,
                        &ticker,
                        Stage::AssembleFeatures,
                        &e,
                        record,
                        Some(&upstream),
                    )));
                }
            }
        }

        outcomes.sort_by_key(|o| symbols.iter().position(|s| s == o.ticker()));

        Ok(PipelineReport {
            started_at,
            config_hash: assembler.config_hash().clone(),
            validation,
            event_columns,
            macro_columns,
            tickers: outcomes,
        })
    }
}
