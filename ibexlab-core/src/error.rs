//! Pipeline error taxonomy.
//!
//! Row-level problems (a missing macro value, an absent event date) are
//! recovered by dropping the row and logging the drop; everything here is
//! surfaced to the caller.

use crate::config::ConfigError;
use crate::data::DataError;
use crate::domain::ConfigHash;
use crate::store::StoreError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed for {ticker}: {source}")]
    Fetch {
        ticker: String,
        #[source]
        source: DataError,
    },

    #[error("integrity failure for {ticker}: {reason}")]
    IntegrityFailure { ticker: String, reason: String },

    #[error("insufficient history for '{indicator}' on {date}")]
    InsufficientHistory { indicator: String, date: NaiveDate },

    #[error(
        "too many dropped rows for {ticker}: {dropped}/{candidates} exceeds threshold {threshold}"
    )]
    DropRateExceeded {
        ticker: String,
        dropped: usize,
        candidates: usize,
        threshold: f64,
    },

    #[error("incomplete source: {artifact} ({reason})")]
    IncompleteSource { artifact: String, reason: String },

    #[error("scaler mismatch: scaler fit for config {expected}, row built for {found}")]
    ScalerMismatch {
        expected: ConfigHash,
        found: ConfigHash,
    },

    #[error("no feature row for {ticker} on {date}: {reason}")]
    NoRowForDate {
        ticker: String,
        date: NaiveDate,
        reason: String,
    },

    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used in halt reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Fetch,
    IntegrityFailure,
    InsufficientHistory,
    IncompleteSource,
    ScalerMismatch,
    Scenario,
    Config,
    Storage,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch { .. } => ErrorKind::Fetch,
            PipelineError::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            PipelineError::InsufficientHistory { .. } | PipelineError::DropRateExceeded { .. } => {
                ErrorKind::InsufficientHistory
            }
            PipelineError::IncompleteSource { .. } => ErrorKind::IncompleteSource,
            PipelineError::ScalerMismatch { .. } => ErrorKind::ScalerMismatch,
            PipelineError::NoRowForDate { .. }
            | PipelineError::InvalidScenario(_)
            | PipelineError::Model(_) => ErrorKind::Scenario,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Store(_) | PipelineError::Io(_) | PipelineError::Serialization(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub(crate) fn incomplete(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::IncompleteSource {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}
