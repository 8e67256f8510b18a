//! Feature rows and the row builder shared by assembly and scenarios.

use super::scaler::{Scaler, RETURN_CHANNEL};
use super::spec::FeatureSpec;
use super::transforms::{lag_window, pct_returns, LagWindow};
use super::TargetKind;
use crate::domain::{ConfigHash, PriceSeries, ScalerId};
use crate::error::PipelineError;
use crate::exogenous::EventColumn;
use crate::lineage::{DropReason, RowDrop};
use crate::macro_series::MacroColumn;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row before scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct UnscaledRow {
    pub date: NaiveDate,
    pub target: f64,
    /// `lags[k]` is the return `k + 1` trading days before `date`.
    pub lags: Vec<f64>,
    pub flags: BTreeMap<String, u8>,
    pub macros: BTreeMap<String, f64>,
    /// Close of the last day inside the lag window, kept for reporting.
    pub base_close: f64,
}

impl UnscaledRow {
    pub fn scale(
        &self,
        ticker: &str,
        scaler: &Scaler,
        scaler_id: &ScalerId,
    ) -> Result<FeatureRow, PipelineError> {
        let lags = self
            .lags
            .iter()
            .map(|r| scaler.transform(RETURN_CHANNEL, *r))
            .collect::<Result<Vec<_>, _>>()?;
        let macros = self
            .macros
            .iter()
            .map(|(name, v)| scaler.transform(name, *v).map(|x| (name.clone(), x)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(FeatureRow {
            ticker: ticker.to_string(),
            date: self.date,
            target: self.target,
            lags,
            flags: self.flags.clone(),
            macros,
            base_close: self.base_close,
            scaler_id: scaler_id.clone(),
        })
    }
}

/// Scaled, model-ready row. Complete by construction: no missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ticker: String,
    pub date: NaiveDate,
    pub target: f64,
    pub lags: Vec<f64>,
    pub flags: BTreeMap<String, u8>,
    pub macros: BTreeMap<String, f64>,
    pub base_close: f64,
    pub scaler_id: ScalerId,
}

impl FeatureRow {
    /// Feature vector in [`FeatureSpec::column_names`] order.
    pub fn values(&self) -> Vec<f64> {
        let mut v = self.lags.clone();
        v.extend(self.flags.values().map(|f| f64::from(*f)));
        v.extend(self.macros.values().copied());
        v
    }
}

/// Immutable output of one assembly, keyed by (ticker, config hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub ticker: String,
    pub config_hash: ConfigHash,
    pub scaler_id: ScalerId,
    pub spec: FeatureSpec,
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
    pub drops: Vec<RowDrop>,
    /// Validated trading dates the rows were built from.
    pub source_dates: usize,
}

impl FeatureSnapshot {
    pub fn row_on(&self, date: NaiveDate) -> Option<&FeatureRow> {
        self.rows
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Rows inside the training range, then the rest.
    pub fn split(&self) -> (&[FeatureRow], &[FeatureRow]) {
        let end = self.spec.train_range.end;
        let idx = self.rows.partition_point(|r| r.date <= end);
        self.rows.split_at(idx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    WarmUp,
    Dropped(RowDrop),
    Row(UnscaledRow),
}

/// Builds rows for one ticker from validated prices and aligned sources.
pub struct RowBuilder<'a> {
    spec: &'a FeatureSpec,
    ticker: &'a str,
    dates: Vec<NaiveDate>,
    closes: Vec<f64>,
    returns: Vec<Option<f64>>,
    events: &'a [EventColumn],
    macros: &'a [MacroColumn],
}

impl<'a> RowBuilder<'a> {
    pub fn new(
        spec: &'a FeatureSpec,
        ticker: &'a str,
        prices: &PriceSeries,
        events: &'a [EventColumn],
        macros: &'a [MacroColumn],
    ) -> Self {
        let dates = prices.dates();
        let closes: Vec<f64> = prices.bars.iter().map(|b| b.close).collect();
        let returns = pct_returns(&closes);
        Self {
            spec,
            ticker,
            dates,
            closes,
            returns,
            events,
            macros,
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn returns(&self) -> &[Option<f64>] {
        &self.returns
    }

    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    fn dropped(&self, t: usize, reason: DropReason, detail: impl Into<String>) -> RowOutcome {
        RowOutcome::Dropped(RowDrop {
            ticker: self.ticker.to_string(),
            date: self.dates[t],
            reason,
            detail: Some(detail.into()),
        })
    }

    /// Row at index `t`.
    pub fn build(&self, t: usize) -> RowOutcome {
        let date = self.dates[t];
        let lags = match lag_window(&self.returns, t, self.spec.lag_window) {
            LagWindow::WarmUp => return RowOutcome::WarmUp,
            LagWindow::Undefined => {
                return self.dropped(t, DropReason::UndefinedReturn, "lag window reaches first observation")
            }
            LagWindow::Ready(lags) => lags,
        };

        let target_idx = t + self.spec.horizon - 1;
        let target = match (self.spec.target, target_idx < self.len()) {
            (_, false) => None,
            (TargetKind::Return, true) => self.returns[target_idx],
            (TargetKind::Close, true) => Some(self.closes[target_idx]),
        };
        let Some(target) = target else {
            return self.dropped(
                t,
                DropReason::MissingTarget,
                format!("no target {} trading days ahead", self.spec.horizon - 1),
            );
        };

        let mut flags = BTreeMap::new();
        for col in self.events {
            match col.value_on(date) {
                Some(v) => {
                    flags.insert(col.column_name.clone(), v);
                }
                None => return self.dropped(t, DropReason::MissingExogenous, col.column_name.clone()),
            }
        }

        let mut macros = BTreeMap::new();
        for col in self.macros {
            match col.require(date) {
                Ok(v) => {
                    macros.insert(col.column_name.clone(), v);
                }
                Err(_) => {
                    return self.dropped(t, DropReason::InsufficientHistory, col.column_name.clone())
                }
            }
        }

        RowOutcome::Row(UnscaledRow {
            date,
            target,
            lags,
            flags,
            macros,
            base_close: self.closes[t - 1],
        })
    }

    /// Row for `date`, or why there is none.
    pub fn build_on(&self, date: NaiveDate) -> Result<UnscaledRow, PipelineError> {
        let no_row = |reason: String| PipelineError::NoRowForDate {
            ticker: self.ticker.to_string(),
            date,
            reason,
        };
        let t = self
            .index_of(date)
            .ok_or_else(|| no_row("not a validated trading date".into()))?;
        match self.build(t) {
            RowOutcome::Row(row) => Ok(row),
            RowOutcome::WarmUp => Err(no_row(format!(
                "fewer than {} prior observations",
                self.spec.lag_window
            ))),
            RowOutcome::Dropped(drop) => Err(no_row(format!("{:?}", drop.reason))),
        }
    }
}
