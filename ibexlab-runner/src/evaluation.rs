//! Forecast evaluation: rmse, mae and r2 of each model on held-out rows.
//!
//! The metric functions are pure: predictions and actuals in, scalar out.
//! [`evaluate_ticker`] runs every configured architecture over the test rows
//! of a committed snapshot and persists one metrics artifact per
//! (ticker, architecture) plus a report keyed by ticker.

use ibexlab_core::config::EvaluationConfig;
use ibexlab_core::domain::{Checksum, ConfigHash, DateRange};
use ibexlab_core::features::FeatureAssembler;
use ibexlab_core::lineage::{LineageRecord, Stage, StageRun};
use ibexlab_core::model::{Architecture, Forecaster, ModelArtifact};
use ibexlab_core::store::ArtifactKey;
use ibexlab_core::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub n: usize,
}

impl ForecastMetrics {
    /// `None` when there is nothing to score.
    pub fn compute(predicted: &[f64], actual: &[f64]) -> Option<Self> {
        if predicted.is_empty() || predicted.len() != actual.len() {
            return None;
        }
        Some(Self {
            rmse: rmse(predicted, actual),
            mae: mae(predicted, actual),
            r2: r2(predicted, actual),
            n: predicted.len(),
        })
    }
}

pub fn rmse(predicted: &[f64], actual: &[f64]) -> f64 {
    if predicted.is_empty() {
        return 0.0;
    }
    let sse: f64 = predicted.iter().zip(actual).map(|(p, a)| (p - a).powi(2)).sum();
    (sse / predicted.len() as f64).sqrt()
}

pub fn mae(predicted: &[f64], actual: &[f64]) -> f64 {
    if predicted.is_empty() {
        return 0.0;
    }
    let sae: f64 = predicted.iter().zip(actual).map(|(p, a)| (p - a).abs()).sum();
    sae / predicted.len() as f64
}

/// Coefficient of determination. A constant actual series scores 1.0 if hit
/// exactly and 0.0 otherwise.
pub fn r2(predicted: &[f64], actual: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let ss_res: f64 = predicted.iter().zip(actual).map(|(p, a)| (a - p).powi(2)).sum();
    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: String,
    pub architecture: Architecture,
    pub baseline: bool,
    pub metrics: ForecastMetrics,
}

/// Metrics of every architecture for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub ticker: String,
    pub config_hash: ConfigHash,
    pub test_range: DateRange,
    pub models: BTreeMap<Architecture, ModelMetrics>,
}

impl MetricsReport {
    /// Lowest-rmse exported model. Baselines share one readout, so they never
    /// win a comparison.
    pub fn best(&self) -> Option<&ModelMetrics> {
        self.models
            .values()
            .filter(|m| !m.baseline)
            .min_by(|a, b| a.metrics.rmse.total_cmp(&b.metrics.rmse))
    }
}

#[derive(Serialize)]
struct EvaluateParams<'a> {
    ticker: &'a str,
    evaluation: &'a EvaluationConfig,
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub report: MetricsReport,
    pub record: LineageRecord,
}

/// Exported model for `architecture`, or a baseline readout fit on the
/// snapshot when there is none or the stored baseline was fit on another
/// scaler.
fn model_for(
    assembler: &FeatureAssembler<'_>,
    snapshot: &ibexlab_core::features::FeatureSnapshot,
    architecture: Architecture,
    ridge: f64,
) -> Result<ModelArtifact, PipelineError> {
    let store = assembler.store();
    match ModelArtifact::load(store, &snapshot.ticker, architecture) {
        Ok(model) if !model.baseline => {
            if model.config_hash != snapshot.config_hash {
                return Err(PipelineError::ScalerMismatch {
                    expected: snapshot.config_hash.clone(),
                    found: model.config_hash,
                });
            }
            Ok(model)
        }
        Ok(model) if model.scaler_id == snapshot.scaler_id => Ok(model),
        Ok(_) | Err(PipelineError::IncompleteSource { .. }) => {
            let model = ModelArtifact::fit_readout(snapshot, architecture, ridge)?;
            model.save(store)?;
            log::info!("{}: fit baseline readout", model.model_id());
            Ok(model)
        }
        Err(e) => Err(e),
    }
}

pub fn evaluate_ticker(
    assembler: &FeatureAssembler<'_>,
    ticker: &str,
    config: &EvaluationConfig,
) -> Result<EvaluationOutcome, PipelineError> {
    let store = assembler.store();
    let snapshot = assembler.load_snapshot(ticker)?;
    let snapshot_key = ArtifactKey::feature_snapshot(ticker, &snapshot.config_hash);
    let (_, test) = snapshot.split();
    let (Some(first), Some(last)) = (test.first(), test.last()) else {
        return Err(PipelineError::InsufficientHistory {
            indicator: format!("{ticker} test rows"),
            date: snapshot.spec.train_range.end,
        });
    };
    let test_range = DateRange {
        start: first.date,
        end: last.date,
    };
    let actual: Vec<f64> = test.iter().map(|r| r.target).collect();

    let mut run = StageRun::new(Stage::Evaluate).params(&EvaluateParams {
        ticker,
        evaluation: config,
    })?;
    if let Some(meta) = store.meta(&snapshot_key)? {
        run = run.input(snapshot_key.id(), meta.checksum);
    }

    let mut models = BTreeMap::new();
    for &architecture in &config.architectures {
        let model = model_for(assembler, &snapshot, architecture, config.ridge)?;
        let predicted = test
            .iter()
            .map(|row| model.predict(row))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(metrics) = ForecastMetrics::compute(&predicted, &actual) else {
            continue;
        };
        run = run.input(model.key().id(), Checksum::of_json(&model)?);

        let entry = ModelMetrics {
            model_id: model.model_id(),
            architecture,
            baseline: model.baseline,
            metrics,
        };
        let write = store.put_json(
            &ArtifactKey::metrics(ticker, architecture.as_str()),
            &entry,
            Some(metrics.n),
        )?;
        run = run.committed(&write);
        log::info!(
            "{}: rmse {:.6} mae {:.6} r2 {:.4} over {} rows",
            entry.model_id,
            metrics.rmse,
            metrics.mae,
            metrics.r2,
            metrics.n
        );
        models.insert(architecture, entry);
    }

    let report = MetricsReport {
        ticker: ticker.to_string(),
        config_hash: snapshot.config_hash.clone(),
        test_range,
        models,
    };
    let write = store.put_json(
        &ArtifactKey::metrics_report(ticker),
        &report,
        Some(report.models.len()),
    )?;
    let record = assembler
        .lineage()
        .append(run.committed(&write).rows("test_rows", test.len()))?;
    Ok(EvaluationOutcome { report, record })
}
