//! Per-channel scaler fit on the training range only.
//!
//! Channels: [`RETURN_CHANNEL`] for every lagged return, plus one channel per
//! macro column. Event flags and the target are left unscaled.

use super::ScalerKind;
use crate::domain::{Checksum, ConfigHash, DateRange, ScalerId};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RETURN_CHANNEL: &str = "returns";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelParams {
    ZScore { mean: f64, std: f64 },
    MinMax { min: f64, max: f64 },
}

impl ChannelParams {
    /// Fit on `samples`. A constant channel gets unit spread so it maps to 0.
    pub fn fit(kind: ScalerKind, samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        Some(match kind {
            ScalerKind::ZScore => {
                let mean = samples.iter().sum::<f64>() / n;
                let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                ChannelParams::ZScore {
                    mean,
                    std: if std > f64::EPSILON { std } else { 1.0 },
                }
            }
            ScalerKind::MinMax => {
                let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
                let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let max = if max - min > f64::EPSILON { max } else { min + 1.0 };
                ChannelParams::MinMax { min, max }
            }
        })
    }

    pub fn apply(&self, x: f64) -> f64 {
        match *self {
            ChannelParams::ZScore { mean, std } => (x - mean) / std,
            ChannelParams::MinMax { min, max } => (x - min) / (max - min),
        }
    }

    pub fn invert(&self, y: f64) -> f64 {
        match *self {
            ChannelParams::ZScore { mean, std } => y * std + mean,
            ChannelParams::MinMax { min, max } => y * (max - min) + min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub ticker: String,
    pub config_hash: ConfigHash,
    pub kind: ScalerKind,
    pub fit_range: DateRange,
    pub channels: BTreeMap<String, ChannelParams>,
}

impl Scaler {
    /// Fit every channel in `samples`. The caller is responsible for passing
    /// only observations dated inside `fit_range`.
    pub fn fit(
        ticker: &str,
        config_hash: ConfigHash,
        kind: ScalerKind,
        fit_range: DateRange,
        samples: &BTreeMap<String, Vec<f64>>,
    ) -> Result<Self, PipelineError> {
        let mut channels = BTreeMap::new();
        for (name, values) in samples {
            let params = ChannelParams::fit(kind, values).ok_or_else(|| {
                PipelineError::InsufficientHistory {
                    indicator: name.clone(),
                    date: fit_range.end,
                }
            })?;
            channels.insert(name.clone(), params);
        }
        Ok(Self {
            ticker: ticker.to_string(),
            config_hash,
            kind,
            fit_range,
            channels,
        })
    }

    /// `{ticker}:{config hash prefix}:{params checksum prefix}`.
    pub fn id(&self) -> Result<ScalerId, PipelineError> {
        let sum = Checksum::of_json(self)?;
        Ok(ScalerId(format!(
            "{}:{}:{}",
            self.ticker,
            self.config_hash.short(),
            sum.short()
        )))
    }

    /// Fatal if `found` is not the hash this scaler was fit for.
    pub fn check_config(&self, found: &ConfigHash) -> Result<(), PipelineError> {
        if &self.config_hash != found {
            return Err(PipelineError::ScalerMismatch {
                expected: self.config_hash.clone(),
                found: found.clone(),
            });
        }
        Ok(())
    }

    pub fn transform(&self, channel: &str, x: f64) -> Result<f64, PipelineError> {
        self.channels
            .get(channel)
            .map(|p| p.apply(x))
            .ok_or_else(|| PipelineError::IncompleteSource {
                artifact: format!("scaler {}", self.ticker),
                reason: format!("no channel '{channel}'"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn mean_std(xs: &[f64]) -> (f64, f64) {
        let n = xs.len() as f64;
        let m = xs.iter().sum::<f64>() / n;
        let v = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n;
        (m, v.sqrt())
    }

    #[test]
    fn zscore_centers_training_data() {
        let xs = [0.01, -0.02, 0.03, 0.0, -0.01];
        let p = ChannelParams::fit(ScalerKind::ZScore, &xs).unwrap();
        let scaled: Vec<f64> = xs.iter().map(|x| p.apply(*x)).collect();
        let (m, s) = mean_std(&scaled);
        assert!(m.abs() < 1e-12);
        assert!((s - 1.0).abs() < 1e-12);
    }

    #[test]
    fn minmax_maps_training_data_to_unit_interval() {
        let xs = [3.0, 5.0, 4.0];
        let p = ChannelParams::fit(ScalerKind::MinMax, &xs).unwrap();
        assert_eq!(p.apply(3.0), 0.0);
        assert_eq!(p.apply(5.0), 1.0);
        // Out-of-sample values may leave the unit interval.
        assert!(p.apply(6.0) > 1.0);
        assert!((p.invert(p.apply(4.2)) - 4.2).abs() < 1e-12);
    }

    #[test]
    fn constant_channel_is_finite() {
        let p = ChannelParams::fit(ScalerKind::ZScore, &[2.0, 2.0]).unwrap();
        assert_eq!(p.apply(2.0), 0.0);
    }

    #[test]
    fn mismatched_hash_is_rejected() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        )
        .unwrap();
        let mut samples = BTreeMap::new();
        samples.insert(RETURN_CHANNEL.to_string(), vec![0.1, 0.2]);
        let scaler = Scaler::fit(
            "SAN.MC",
            ConfigHash("aaa".into()),
            ScalerKind::ZScore,
            range,
            &samples,
        )
        .unwrap();
        assert!(scaler.check_config(&ConfigHash("aaa".into())).is_ok());
        assert!(matches!(
            scaler.check_config(&ConfigHash("bbb".into())),
            Err(PipelineError::ScalerMismatch { .. })
        ));
    }

    #[test]
    fn empty_channel_fails_fit() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        )
        .unwrap();
        let mut samples = BTreeMap::new();
        samples.insert("MACRO_x".to_string(), vec![]);
        assert!(Scaler::fit("SAN.MC", ConfigHash("a".into()), ScalerKind::MinMax, range, &samples)
            .is_err());
    }
}
