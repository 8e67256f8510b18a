//! Typed pipeline configuration.
//!
//! One TOML file drives every stage. All recognized options are enumerated
//! here and checked by [`PipelineConfig::validate`] at load time, so a bad
//! value fails before any data is touched.

use crate::domain::{Asset, DateRange, TradingCalendar};
use crate::exogenous::EventWindow;
use crate::features::{ScalerKind, TargetKind};
use crate::macro_series::SourceFrequency;
use crate::model::Architecture;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub dates: DatesConfig,
    pub universe: UniverseConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub calendar: TradingCalendar,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub features: FeatureSettings,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub events: Vec<EventWindow>,
    #[serde(default)]
    pub macro_sources: BTreeMap<String, MacroSourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatesConfig {
    /// First date of history.
    pub start: NaiveDate,
    /// Last date of the scaler fit (training) range.
    pub train_end: NaiveDate,
    /// Last date of history.
    pub end: NaiveDate,
}

impl DatesConfig {
    pub fn full_range(&self) -> DateRange {
        DateRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn train_range(&self) -> DateRange {
        DateRange {
            start: self.start,
            end: self.train_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseConfig {
    pub targets: Vec<Asset>,
    #[serde(default)]
    pub references: Vec<Asset>,
}

impl UniverseConfig {
    /// Targets first, then references.
    pub fn all_symbols(&self) -> Vec<String> {
        self.targets
            .iter()
            .chain(self.references.iter())
            .map(|a| a.symbol.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    pub cache_dir: PathBuf,
    pub lineage_path: PathBuf,
    /// Directory of loose CSV exports for the `csv` provider.
    #[serde(default)]
    pub raw_csv_dir: Option<PathBuf>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache"),
            lineage_path: PathBuf::from("logs/data_lineage.jsonl"),
            raw_csv_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Yahoo,
    Csv,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct FetchConfig {
    pub provider: ProviderKind,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Consecutive failed requests that open the circuit breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker refuses requests.
    pub breaker_cooldown_secs: u64,
    /// Seed for the synthetic provider.
    pub seed: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Yahoo,
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 500,
            breaker_threshold: 3,
            breaker_cooldown_secs: 30 * 60,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Absolute close-to-close return above which a bar counts as out of range.
    pub shock_threshold: f64,
    /// Longest run of missing trading days repaired by interpolation.
    pub max_fillable_gap: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            shock_threshold: 0.25,
            max_fillable_gap: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureSettings {
    pub lag_window: usize,
    /// Trading days ahead of the row date that the target refers to (1 = same day close).
    pub horizon: usize,
    pub target: TargetKind,
    pub scaler: ScalerKind,
    /// Fraction of alignment drops above which assembly fails.
    pub drop_rate_threshold: f64,
    /// Maximum age of an upstream artifact before it counts as stale.
    pub freshness_days: i64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            lag_window: 20,
            horizon: 1,
            target: TargetKind::Return,
            scaler: ScalerKind::ZScore,
            drop_rate_threshold: 0.05,
            freshness_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationConfig {
    pub architectures: Vec<Architecture>,
    /// Ridge penalty for baseline readouts, fit when no exported model exists.
    pub ridge: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            architectures: Architecture::ALL.to_vec(),
            ridge: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacroSourceConfig {
    /// CSV file with a `Date` column and one value column.
    pub path: PathBuf,
    pub value_column: String,
    pub frequency: SourceFrequency,
    /// Value used for dates before the first observation.
    #[serde(default)]
    pub default: Option<f64>,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dates;
        if d.start > d.end {
            return Err(invalid(format!("dates.start {} after dates.end {}", d.start, d.end)));
        }
        if d.train_end < d.start || d.train_end > d.end {
            return Err(invalid(format!(
                "dates.train_end {} outside {}..={}",
                d.train_end, d.start, d.end
            )));
        }
        if self.universe.targets.is_empty() {
            return Err(invalid("universe.targets is empty"));
        }

        let f = &self.features;
        if f.lag_window == 0 {
            return Err(invalid("features.lag_window must be at least 1"));
        }
        if !(1..=5).contains(&f.horizon) {
            return Err(invalid(format!("features.horizon {} outside 1..=5", f.horizon)));
        }
        if !(f.drop_rate_threshold > 0.0 && f.drop_rate_threshold <= 1.0) {
            return Err(invalid("features.drop_rate_threshold must be in (0, 1]"));
        }
        if f.freshness_days <= 0 {
            return Err(invalid("features.freshness_days must be positive"));
        }

        let v = &self.validation;
        if v.shock_threshold <= 0.0 || !v.shock_threshold.is_finite() {
            return Err(invalid("validation.shock_threshold must be positive"));
        }

        if !(self.evaluation.ridge >= 0.0 && self.evaluation.ridge.is_finite()) {
            return Err(invalid("evaluation.ridge must be a non-negative number"));
        }

        if self.fetch.max_retries == 0 || self.fetch.timeout_secs == 0 {
            return Err(invalid("fetch.max_retries and fetch.timeout_secs must be positive"));
        }
        if self.fetch.breaker_threshold == 0 {
            return Err(invalid("fetch.breaker_threshold must be positive"));
        }

        let mut seen = HashSet::new();
        for ev in &self.events {
            if ev.start_date > ev.end_date {
                return Err(invalid(format!(
                    "event '{}' starts {} after it ends {}",
                    ev.event_id, ev.start_date, ev.end_date
                )));
            }
            if !seen.insert(ev.event_id.as_str()) {
                return Err(invalid(format!("duplicate event id '{}'", ev.event_id)));
            }
            if ev.category.trim().is_empty() {
                return Err(invalid(format!("event '{}' has an empty category", ev.event_id)));
            }
        }

        for (name, src) in &self.macro_sources {
            if src.value_column.trim().is_empty() {
                return Err(invalid(format!("macro source '{name}' has an empty value_column")));
            }
        }
        Ok(())
    }

    /// Event categories in column order.
    pub fn event_categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self.events.iter().map(|e| e.category.clone()).collect();
        cats.sort();
        cats.dedup();
        cats
    }

    /// Macro indicator names in column order.
    pub fn macro_indicators(&self) -> Vec<String> {
        self.macro_sources.keys().cloned().collect()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
