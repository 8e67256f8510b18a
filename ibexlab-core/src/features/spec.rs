//! Feature configuration and its content hash.

use super::{ScalerKind, TargetKind};
use crate::config::PipelineConfig;
use crate::domain::{ConfigHash, DateRange};
use crate::exogenous::event_column_name;
use crate::macro_series::macro_column_name;
use serde::{Deserialize, Serialize};

/// Everything that determines the content of a feature snapshot apart from
/// the upstream data itself. Two specs with equal hashes produce identical
/// snapshots from identical inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub lag_window: usize,
    pub horizon: usize,
    pub target: TargetKind,
    pub scaler: ScalerKind,
    pub full_range: DateRange,
    pub train_range: DateRange,
    /// `EVT_*` names, sorted.
    pub event_columns: Vec<String>,
    /// `MACRO_*` names, sorted.
    pub macro_columns: Vec<String>,
}

impl FeatureSpec {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut event_columns: Vec<String> = config
            .event_categories()
            .iter()
            .map(|c| event_column_name(c))
            .collect();
        event_columns.sort();
        event_columns.dedup();
        let mut macro_columns: Vec<String> = config
            .macro_indicators()
            .iter()
            .map(|m| macro_column_name(m))
            .collect();
        macro_columns.sort();

        Self {
            lag_window: config.features.lag_window,
            horizon: config.features.horizon,
            target: config.features.target,
            scaler: config.features.scaler,
            full_range: config.dates.full_range(),
            train_range: config.dates.train_range(),
            event_columns,
            macro_columns,
        }
    }

    /// BLAKE3 over the canonical JSON encoding.
    pub fn config_hash(&self) -> Result<ConfigHash, serde_json::Error> {
        Ok(ConfigHash::from_bytes(&serde_json::to_vec(self)?))
    }

    pub fn lag_names(&self) -> Vec<String> {
        (1..=self.lag_window).map(|k| format!("lag_{k}")).collect()
    }

    /// Feature columns in row order: lags, event flags, macro values.
    pub fn column_names(&self) -> Vec<String> {
        let mut cols = self.lag_names();
        cols.extend(self.event_columns.iter().cloned());
        cols.extend(self.macro_columns.iter().cloned());
        cols
    }
}
