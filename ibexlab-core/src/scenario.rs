//! What-if inference under overridden event flags.
//!
//! A scenario rebuilds one feature row from committed sources, substitutes
//! the requested flag values, scales both rows with the stored scaler and
//! asks the model for a prediction. Only the named flag columns differ
//! between the base and perturbed rows.

use crate::domain::Checksum;
use crate::error::PipelineError;
use crate::exogenous::event_column_name;
use crate::features::{FeatureAssembler, FeatureRow, RowBuilder};
use crate::lineage::{LineageRecord, Stage, StageRun};
use crate::model::{Forecaster, ModelArtifact};
use crate::store::ArtifactKey;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Two-sided 95% normal quantile.
const BAND_Z: f64 = 1.96;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub ticker: String,
    pub base_date: NaiveDate,
    /// Event column (or category) to forced value, 0 or 1.
    pub overrides: BTreeMap<String, u8>,
    /// `{ticker}:{architecture}`.
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub ticker: String,
    pub base_date: NaiveDate,
    pub model_id: String,
    pub predicted_value: f64,
    pub confidence_band: (f64, f64),
    /// Prediction for the unmodified row.
    pub base_prediction: f64,
    pub base_row: FeatureRow,
    pub perturbed_row: FeatureRow,
    /// Columns whose value actually changed.
    pub changed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub result: ScenarioResult,
    pub record: LineageRecord,
}

/// Resolve override keys to event column names and check values.
fn resolve_overrides(
    assembler: &FeatureAssembler<'_>,
    overrides: &BTreeMap<String, u8>,
) -> Result<BTreeMap<String, u8>, PipelineError> {
    let known = &assembler.spec().event_columns;
    let mut resolved = BTreeMap::new();
    for (key, &value) in overrides {
        if value > 1 {
            return Err(PipelineError::InvalidScenario(format!(
                "override {key}={value}: flags are 0 or 1"
            )));
        }
        let column = if known.contains(key) {
            key.clone()
        } else {
            let named = event_column_name(key);
            if !known.contains(&named) {
                return Err(PipelineError::InvalidScenario(format!(
                    "unknown event column '{key}' (known: {})",
                    known.join(", ")
                )));
            }
            named
        };
        if resolved.insert(column.clone(), value).is_some() {
            return Err(PipelineError::InvalidScenario(format!(
                "column {column} overridden twice"
            )));
        }
    }
    Ok(resolved)
}

/// Run a scenario against an already loaded model.
pub fn simulate(
    assembler: &FeatureAssembler<'_>,
    model: &dyn Forecaster,
    request: &ScenarioRequest,
    as_of: DateTime<Utc>,
) -> Result<ScenarioOutcome, PipelineError> {
    let overrides = resolve_overrides(assembler, &request.overrides)?;
    let ticker = request.ticker.as_str();

    let scaler = assembler.load_scaler(ticker)?;
    scaler.check_config(model.config_hash())?;
    scaler.check_config(assembler.config_hash())?;
    let scaler_id = scaler.id()?;

    let sources = assembler.load_sources(ticker, as_of)?;
    let builder = RowBuilder::new(
        assembler.spec(),
        ticker,
        &sources.prices.series,
        &sources.events,
        &sources.macros,
    );
    let base = builder.build_on(request.base_date)?;
    let mut perturbed = base.clone();
    for (column, value) in &overrides {
        perturbed.flags.insert(column.clone(), *value);
    }

    let base_row = base.scale(ticker, &scaler, &scaler_id)?;
    let perturbed_row = perturbed.scale(ticker, &scaler, &scaler_id)?;
    let base_prediction = model.predict(&base_row)?;
    let predicted_value = model.predict(&perturbed_row)?;
    let half = BAND_Z * model.residual_std();

    let changed = overrides
        .iter()
        .filter(|(c, v)| base_row.flags.get(*c) != Some(v))
        .map(|(c, _)| c.clone())
        .collect();

    let result = ScenarioResult {
        ticker: ticker.to_string(),
        base_date: request.base_date,
        model_id: model.model_id(),
        predicted_value,
        confidence_band: (predicted_value - half, predicted_value + half),
        base_prediction,
        base_row,
        perturbed_row,
        changed,
    };

    let store = assembler.store();
    let mut run = StageRun::new(Stage::Simulate).params(request)?;
    for (k, v) in &sources.inputs {
        run = run.input(k.clone(), v.clone());
    }
    let scaler_key = ArtifactKey::scaler(ticker, assembler.config_hash());
    if let Some(meta) = store.meta(&scaler_key)? {
        run = run.input(scaler_key.id(), meta.checksum);
    }
    let result_sum = Checksum::of_json(&result)?;
    let run = run.output(
        format!("scenario/{}/{}/{}", ticker, request.base_date, result_sum.short()),
        result_sum,
    );
    let record = assembler.lineage().append(run)?;

    log::info!(
        "scenario {} {} {:?}: {:.6} (base {:.6})",
        result.model_id,
        request.base_date,
        overrides,
        result.predicted_value,
        result.base_prediction
    );
    Ok(ScenarioOutcome { result, record })
}

/// Load the model named in the request and run the scenario.
pub fn run_scenario(
    assembler: &FeatureAssembler<'_>,
    request: &ScenarioRequest,
    as_of: DateTime<Utc>,
) -> Result<ScenarioOutcome, PipelineError> {
    let model = ModelArtifact::load_by_id(assembler.store(), &request.model_id)?;
    if model.ticker != request.ticker {
        return Err(PipelineError::InvalidScenario(format!(
            "model {} was trained for {}, not {}",
            request.model_id, model.ticker, request.ticker
        )));
    }
    simulate(assembler, &model, request, as_of)
}
