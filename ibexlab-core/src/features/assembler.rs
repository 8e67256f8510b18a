//! Feature assembler.
//!
//! Joins validated prices with the event and macro columns on trading date,
//! builds lag windows over percent returns, fits the scaler on the training
//! range and commits the scaled rows as a snapshot keyed by
//! `(ticker, config hash)`.
//!
//! Every upstream artifact must be committed and younger than the freshness
//! threshold, otherwise assembly fails with `IncompleteSource` before any row
//! is built.

use super::row::{FeatureSnapshot, RowBuilder, RowOutcome, UnscaledRow};
use super::scaler::{Scaler, RETURN_CHANNEL};
use super::spec::FeatureSpec;
use crate::config::{FeatureSettings, PipelineConfig};
use crate::domain::{Checksum, ConfigHash};
use crate::error::PipelineError;
use crate::exogenous::EventColumn;
use crate::integrity::{ValidatedPrices, ValidationReport};
use crate::lineage::{DropReason, LineageLog, LineageRecord, RowDrop, Stage, StageRun};
use crate::macro_series::MacroColumn;
use crate::store::{ArtifactKey, ArtifactMeta, ArtifactStore, KeyLock, WriteOutcome};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const SCALER_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const SCALER_LOCK_STALE: Duration = Duration::from_secs(600);

/// Committed meta of `key`, failing if it is absent or older than `max_age`.
pub fn require_fresh(
    store: &ArtifactStore,
    key: &ArtifactKey,
    as_of: DateTime<Utc>,
    max_age: chrono::Duration,
) -> Result<ArtifactMeta, PipelineError> {
    let meta = store
        .meta(key)?
        .ok_or_else(|| PipelineError::incomplete(key.id(), "not committed"))?;
    let age = meta.age(as_of);
    if age > max_age {
        return Err(PipelineError::incomplete(
            key.id(),
            format!(
                "stale: committed {} ({}h old, limit {}h)",
                meta.created_at,
                age.num_hours(),
                max_age.num_hours()
            ),
        ));
    }
    Ok(meta)
}

fn load_fresh<T: DeserializeOwned>(
    store: &ArtifactStore,
    key: &ArtifactKey,
    as_of: DateTime<Utc>,
    max_age: chrono::Duration,
) -> Result<(T, ArtifactMeta), PipelineError> {
    let meta = require_fresh(store, key, as_of, max_age)?;
    let value = store
        .get_json(key)?
        .ok_or_else(|| PipelineError::incomplete(key.id(), "payload missing"))?;
    Ok((value, meta))
}

#[derive(Serialize)]
struct AssembleParams<'a> {
    ticker: &'a str,
    spec: &'a FeatureSpec,
}

/// Upstream inputs of one ticker, with the checksums they were read at.
#[derive(Debug, Clone)]
pub struct LoadedSources {
    pub prices: ValidatedPrices,
    pub events: Vec<EventColumn>,
    pub macros: Vec<MacroColumn>,
    pub inputs: BTreeMap<String, Checksum>,
}

#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    pub snapshot: FeatureSnapshot,
    pub scaler: Scaler,
    pub snapshot_write: WriteOutcome,
    pub scaler_write: WriteOutcome,
    pub record: LineageRecord,
}

pub struct FeatureAssembler<'a> {
    store: &'a ArtifactStore,
    lineage: &'a LineageLog,
    spec: FeatureSpec,
    config_hash: ConfigHash,
    drop_rate_threshold: f64,
    freshness: chrono::Duration,
}

impl<'a> FeatureAssembler<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        lineage: &'a LineageLog,
        spec: FeatureSpec,
        settings: &FeatureSettings,
    ) -> Result<Self, PipelineError> {
        let config_hash = spec.config_hash()?;
        Ok(Self {
            store,
            lineage,
            spec,
            config_hash,
            drop_rate_threshold: settings.drop_rate_threshold,
            freshness: chrono::Duration::days(settings.freshness_days),
        })
    }

    pub fn from_config(
        store: &'a ArtifactStore,
        lineage: &'a LineageLog,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        Self::new(store, lineage, FeatureSpec::from_config(config), &config.features)
    }

    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    pub fn config_hash(&self) -> &ConfigHash {
        &self.config_hash
    }

    pub fn store(&self) -> &ArtifactStore {
        self.store
    }

    pub fn lineage(&self) -> &LineageLog {
        self.lineage
    }

    /// Load and freshness-check every upstream artifact for `ticker`.
    pub fn load_sources(&self, ticker: &str, as_of: DateTime<Utc>) -> Result<LoadedSources, PipelineError> {
        let range = &self.spec.full_range;
        let mut inputs = BTreeMap::new();

        let report_key = ArtifactKey::validation_report(ticker, range);
        let validated_key = ArtifactKey::validated_prices(ticker, range);
        let (report, _): (ValidationReport, _) =
            load_fresh(self.store, &report_key, as_of, self.freshness)?;
        if let Some(reason) = report.failure_summary() {
            return Err(PipelineError::incomplete(
                validated_key.id(),
                format!("validation FAIL: {reason}"),
            ));
        }
        let (prices, meta): (ValidatedPrices, _) =
            load_fresh(self.store, &validated_key, as_of, self.freshness)?;
        if prices.raw_checksum != report.raw_checksum {
            return Err(PipelineError::incomplete(
                validated_key.id(),
                "validated prices predate the latest validation report",
            ));
        }
        inputs.insert(validated_key.id(), meta.checksum);

        let mut events = Vec::with_capacity(self.spec.event_columns.len());
        for name in &self.spec.event_columns {
            let key = ArtifactKey::event_column(name, range);
            let (col, meta): (EventColumn, _) = load_fresh(self.store, &key, as_of, self.freshness)?;
            inputs.insert(key.id(), meta.checksum);
            events.push(col);
        }

        let mut macros = Vec::with_capacity(self.spec.macro_columns.len());
        for name in &self.spec.macro_columns {
            let key = ArtifactKey::macro_column(name, range);
            let (col, meta): (MacroColumn, _) = load_fresh(self.store, &key, as_of, self.freshness)?;
            inputs.insert(key.id(), meta.checksum);
            macros.push(col);
        }

        Ok(LoadedSources {
            prices,
            events,
            macros,
            inputs,
        })
    }

    /// Training-range samples per scaler channel.
    fn training_samples(&self, builder: &RowBuilder<'_>, macros: &[MacroColumn]) -> BTreeMap<String, Vec<f64>> {
        let train = &self.spec.train_range;
        let mut samples = BTreeMap::new();
        samples.insert(
            RETURN_CHANNEL.to_string(),
            builder
                .dates()
                .iter()
                .zip(builder.returns())
                .filter(|(d, _)| train.contains(**d))
                .filter_map(|(_, r)| *r)
                .collect(),
        );
        for col in macros {
            samples.insert(
                col.column_name.clone(),
                col.dates
                    .iter()
                    .zip(&col.values)
                    .filter(|(d, _)| train.contains(**d))
                    .filter_map(|(_, v)| *v)
                    .collect(),
            );
        }
        samples
    }

    /// Fit and commit the scaler while holding the single-writer lock for
    /// `(ticker, config hash)`.
    fn fit_scaler(
        &self,
        ticker: &str,
        builder: &RowBuilder<'_>,
        macros: &[MacroColumn],
    ) -> Result<(Scaler, WriteOutcome), PipelineError> {
        let key = ArtifactKey::scaler(ticker, &self.config_hash);
        let _lock = KeyLock::acquire(
            self.store.root(),
            &format!("scaler:{}", key.id()),
            SCALER_LOCK_TIMEOUT,
            SCALER_LOCK_STALE,
        )?;

        let scaler = Scaler::fit(
            ticker,
            self.config_hash.clone(),
            self.spec.scaler,
            self.spec.train_range,
            &self.training_samples(builder, macros),
        )?;
        let write = self.store.put_json(&key, &scaler, Some(scaler.channels.len()))?;
        Ok((scaler, write))
    }

    pub fn assemble(&self, ticker: &str, as_of: DateTime<Utc>) -> Result<AssemblyOutcome, PipelineError> {
        let sources = self.load_sources(ticker, as_of)?;
        let series = &sources.prices.series;
        let builder = RowBuilder::new(&self.spec, ticker, series, &sources.events, &sources.macros);

        let mut unscaled: Vec<UnscaledRow> = Vec::new();
        let mut drops: Vec<RowDrop> = Vec::new();
        let mut candidates = 0usize;
        for t in 0..builder.len() {
            match builder.build(t) {
                RowOutcome::WarmUp => {}
                RowOutcome::Dropped(drop) => {
                    candidates += 1;
                    drops.push(drop);
                }
                RowOutcome::Row(row) => {
                    candidates += 1;
                    unscaled.push(row);
                }
            }
        }

        let mut by_reason: BTreeMap<&'static str, usize> = BTreeMap::new();
        for d in &drops {
            *by_reason.entry(reason_label(d.reason)).or_default() += 1;
        }
        let alignment_drops = drops
            .iter()
            .filter(|d| {
                matches!(
                    d.reason,
                    DropReason::MissingExogenous | DropReason::InsufficientHistory
                )
            })
            .count();

        let mut run = StageRun::new(Stage::AssembleFeatures)
            .params(&AssembleParams {
                ticker,
                spec: &self.spec,
            })?
            .rows("source_dates", builder.len())
            .rows("candidates", candidates);
        for (k, v) in &sources.inputs {
            run = run.input(k.clone(), v.clone());
        }
        for (label, n) in &by_reason {
            run = run.rows(format!("dropped_{label}"), *n);
        }

        if candidates > 0 && alignment_drops as f64 / candidates as f64 > self.drop_rate_threshold {
            let err = PipelineError::DropRateExceeded {
                ticker: ticker.to_string(),
                dropped: alignment_drops,
                candidates,
                threshold: self.drop_rate_threshold,
            };
            self.lineage
                .append(run.drops(drops).halted(err.to_string()))?;
            return Err(err);
        }
        if unscaled.is_empty() {
            let err = PipelineError::InsufficientHistory {
                indicator: format!("{ticker} returns"),
                date: series.last_date().unwrap_or(self.spec.full_range.end),
            };
            self.lineage
                .append(run.drops(drops).halted(err.to_string()))?;
            return Err(err);
        }

        let (scaler, scaler_write) = self.fit_scaler(ticker, &builder, &sources.macros)?;
        let scaler_id = scaler.id()?;
        let rows = unscaled
            .iter()
            .map(|r| r.scale(ticker, &scaler, &scaler_id))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = FeatureSnapshot {
            ticker: ticker.to_string(),
            config_hash: self.config_hash.clone(),
            scaler_id,
            spec: self.spec.clone(),
            columns: self.spec.column_names(),
            rows,
            drops: drops.clone(),
            source_dates: builder.len(),
        };
        let key = ArtifactKey::feature_snapshot(ticker, &self.config_hash);
        let snapshot_write = self.store.put_json(&key, &snapshot, Some(snapshot.rows.len()))?;

        let record = self.lineage.append(
            run.committed(&scaler_write)
                .committed(&snapshot_write)
                .rows("rows", snapshot.rows.len())
                .drops(drops),
        )?;

        log::info!(
            "{ticker}: {} feature rows ({} dates, {} dropped) -> {}",
            snapshot.rows.len(),
            builder.len(),
            snapshot.drops.len(),
            key
        );
        Ok(AssemblyOutcome {
            snapshot,
            scaler,
            snapshot_write,
            scaler_write,
            record,
        })
    }

    /// Committed snapshot for `ticker` under this assembler's config hash.
    pub fn load_snapshot(&self, ticker: &str) -> Result<FeatureSnapshot, PipelineError> {
        let key = ArtifactKey::feature_snapshot(ticker, &self.config_hash);
        let snapshot: FeatureSnapshot = self
            .store
            .get_json(&key)?
            .ok_or_else(|| PipelineError::incomplete(key.id(), "feature snapshot not assembled"))?;
        if snapshot.config_hash != self.config_hash {
            return Err(PipelineError::ScalerMismatch {
                expected: self.config_hash.clone(),
                found: snapshot.config_hash,
            });
        }
        Ok(snapshot)
    }

    pub fn load_scaler(&self, ticker: &str) -> Result<Scaler, PipelineError> {
        let key = ArtifactKey::scaler(ticker, &self.config_hash);
        self.store
            .get_json(&key)?
            .ok_or_else(|| PipelineError::incomplete(key.id(), "scaler not fitted"))
    }
}

fn reason_label(reason: DropReason) -> &'static str {
    match reason {
        DropReason::UndefinedReturn => "undefined_return",
        DropReason::MissingExogenous => "missing_exogenous",
        DropReason::InsufficientHistory => "insufficient_history",
        DropReason::MissingTarget => "missing_target",
    }
}
