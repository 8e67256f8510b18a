//! Trained model artifacts and the inference seam.
//!
//! Training happens outside this crate. What comes back is the exported
//! readout of a recurrent network: one weight per feature column plus a bias,
//! tagged with the architecture it came from and the feature config hash it
//! was trained against. [`ModelArtifact::fit_readout`] produces the same
//! artifact from a snapshot by ridge regression, for offline runs and tests.

use crate::domain::{ConfigHash, DateRange, ScalerId};
use crate::error::PipelineError;
use crate::features::{FeatureRow, FeatureSnapshot};
use crate::store::{ArtifactKey, ArtifactStore, WriteOutcome};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Rnn,
    Lstm,
    Gru,
}

impl Architecture {
    pub const ALL: [Architecture; 3] = [Architecture::Rnn, Architecture::Lstm, Architecture::Gru];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Rnn => "rnn",
            Architecture::Lstm => "lstm",
            Architecture::Gru => "gru",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rnn" => Ok(Architecture::Rnn),
            "lstm" => Ok(Architecture::Lstm),
            "gru" => Ok(Architecture::Gru),
            other => Err(PipelineError::Model(format!("unknown architecture '{other}'"))),
        }
    }
}

/// Inference over scaled feature rows.
pub trait Forecaster: Send + Sync {
    /// `{ticker}:{architecture}`.
    fn model_id(&self) -> String;

    /// Feature config the model was trained against.
    fn config_hash(&self) -> &ConfigHash;

    fn predict(&self, row: &FeatureRow) -> Result<f64, PipelineError>;

    /// Standard deviation of training residuals, used for confidence bands.
    fn residual_std(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub ticker: String,
    pub architecture: Architecture,
    pub config_hash: ConfigHash,
    pub scaler_id: ScalerId,
    /// Feature column names in weight order.
    pub columns: Vec<String>,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub residual_std: f64,
    pub trained_on: DateRange,
    /// Fit here by [`ModelArtifact::fit_readout`] rather than exported.
    #[serde(default)]
    pub baseline: bool,
}

impl ModelArtifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::model(&self.ticker, self.architecture.as_str())
    }

    pub fn save(&self, store: &ArtifactStore) -> Result<WriteOutcome, PipelineError> {
        Ok(store.put_json(&self.key(), self, Some(self.weights.len()))?)
    }

    pub fn load(
        store: &ArtifactStore,
        ticker: &str,
        architecture: Architecture,
    ) -> Result<Self, PipelineError> {
        let key = ArtifactKey::model(ticker, architecture.as_str());
        store
            .get_json(&key)?
            .ok_or_else(|| PipelineError::incomplete(key.id(), "no trained model"))
    }

    /// Load by `{ticker}:{architecture}` id.
    pub fn load_by_id(store: &ArtifactStore, model_id: &str) -> Result<Self, PipelineError> {
        let (ticker, arch) = model_id
            .rsplit_once(':')
            .ok_or_else(|| PipelineError::Model(format!("malformed model id '{model_id}'")))?;
        Self::load(store, ticker, arch.parse()?)
    }

    /// Ridge readout fit on the snapshot's training rows.
    pub fn fit_readout(
        snapshot: &FeatureSnapshot,
        architecture: Architecture,
        ridge: f64,
    ) -> Result<Self, PipelineError> {
        let (train, _) = snapshot.split();
        if train.is_empty() {
            return Err(PipelineError::Model(format!(
                "{}: no training rows in snapshot",
                snapshot.ticker
            )));
        }
        let x = design_matrix(train)?;
        let y: Array1<f64> = train.iter().map(|r| r.target).collect();
        let (weights, bias) = ridge_fit(&x, &y, ridge)
            .ok_or_else(|| PipelineError::Model(format!("{}: singular design matrix", snapshot.ticker)))?;

        let residuals = x.dot(&weights) + bias - &y;
        let residual_std = residuals.mapv(|r| r * r).mean().unwrap_or(0.0).sqrt();

        Ok(Self {
            ticker: snapshot.ticker.clone(),
            architecture,
            config_hash: snapshot.config_hash.clone(),
            scaler_id: snapshot.scaler_id.clone(),
            columns: snapshot.columns.clone(),
            weights: weights.to_vec(),
            bias,
            residual_std,
            trained_on: snapshot.spec.train_range,
            baseline: true,
        })
    }
}

impl Forecaster for ModelArtifact {
    fn model_id(&self) -> String {
        format!("{}:{}", self.ticker, self.architecture)
    }

    fn config_hash(&self) -> &ConfigHash {
        &self.config_hash
    }

    fn predict(&self, row: &FeatureRow) -> Result<f64, PipelineError> {
        if row.scaler_id != self.scaler_id {
            return Err(PipelineError::Model(format!(
                "{}: row scaled by {}, model trained on {}",
                self.model_id(),
                row.scaler_id,
                self.scaler_id
            )));
        }
        let values = row.values();
        if values.len() != self.weights.len() {
            return Err(PipelineError::Model(format!(
                "{}: row has {} features, model expects {}",
                self.model_id(),
                values.len(),
                self.weights.len()
            )));
        }
        Ok(ArrayView1::from(&self.weights[..]).dot(&ArrayView1::from(&values[..])) + self.bias)
    }

    fn residual_std(&self) -> f64 {
        self.residual_std
    }
}

/// One row per training sample, columns in snapshot order.
fn design_matrix(rows: &[FeatureRow]) -> Result<Array2<f64>, PipelineError> {
    let p = rows.first().map_or(0, |r| r.values().len());
    let flat: Vec<f64> = rows.iter().flat_map(|r| r.values()).collect();
    Array2::from_shape_vec((rows.len(), p), flat)
        .map_err(|e| PipelineError::Model(format!("ragged feature rows: {e}")))
}

/// Ridge on centered data: solves `(X'X + lambda I) w = X'y` and recovers
/// the bias from the means. `None` when the system is not positive definite.
fn ridge_fit(x: &Array2<f64>, y: &Array1<f64>, lambda: f64) -> Option<(Array1<f64>, f64)> {
    let x_mean = x.mean_axis(Axis(0))?;
    let y_mean = y.mean()?;
    let xc = x - &x_mean;
    let yc = y - y_mean;

    let mut gram = xc.t().dot(&xc);
    gram.diag_mut().mapv_inplace(|v| v + lambda);
    let rhs = xc.t().dot(&yc);

    let w = cholesky_solve(&gram, &rhs)?;
    let bias = y_mean - x_mean.dot(&w);
    Some((w, bias))
}

fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum = l.row(i).slice(s![..j]).dot(&l.row(j).slice(s![..j]));
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 1e-12 {
                    return None;
                }
                l[[i, i]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // L z = b, then L' w = z.
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum = l.row(i).slice(s![..i]).dot(&z.slice(s![..i]));
        z[i] = (b[i] - sum) / l[[i, i]];
    }
    let mut w = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum = l.column(i).slice(s![i + 1..]).dot(&w.slice(s![i + 1..]));
        w[i] = (z[i] - sum) / l[[i, i]];
    }
    Some(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    #[test]
    fn ridge_recovers_linear_relation() {
        let x = Array2::from_shape_fn((50, 2), |(i, j)| match j {
            0 => (i as f64 * 0.37).sin(),
            _ => (i as f64 * 0.11).cos(),
        });
        let y: Array1<f64> = x.rows().into_iter().map(|r| 2.0 * r[0] - 0.5 * r[1] + 0.3).collect();
        let (w, b) = ridge_fit(&x, &y, 1e-9).unwrap();
        assert!((w[0] - 2.0).abs() < 1e-6);
        assert!((w[1] + 0.5).abs() < 1e-6);
        assert!((b - 0.3).abs() < 1e-6);
    }

    #[test]
    fn singular_without_ridge_is_none() {
        let x = ndarray::array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let y = ndarray::array![1.0, 2.0, 3.0];
        assert!(ridge_fit(&x, &y, 0.0).is_none());
        assert!(ridge_fit(&x, &y, 0.1).is_some());
    }

    #[test]
    fn architecture_parses_case_insensitively() {
        assert_eq!("LSTM".parse::<Architecture>().unwrap(), Architecture::Lstm);
        assert!("transformer".parse::<Architecture>().is_err());
    }

    #[test]
    fn predict_rejects_foreign_rows() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let model = ModelArtifact {
            ticker: "SAN.MC".into(),
            architecture: Architecture::Gru,
            config_hash: ConfigHash("abc".into()),
            scaler_id: ScalerId("SAN.MC:abc:111".into()),
            columns: vec!["lag_1".into(), "EVT_crisis".into()],
            weights: vec![0.5, -0.2],
            bias: 0.01,
            residual_std: 0.02,
            trained_on: DateRange::new(date, date).unwrap(),
            baseline: false,
        };
        let mut row = FeatureRow {
            ticker: "SAN.MC".into(),
            date,
            target: 0.0,
            lags: vec![0.4],
            flags: BTreeMap::from([("EVT_crisis".to_string(), 1)]),
            macros: BTreeMap::new(),
            base_close: 4.0,
            scaler_id: ScalerId("SAN.MC:abc:111".into()),
        };
        let p = model.predict(&row).unwrap();
        assert!((p - (0.2 - 0.2 + 0.01)).abs() < 1e-12);

        row.scaler_id = ScalerId("SAN.MC:def:222".into());
        assert!(model.predict(&row).is_err());
    }
}
