//! Feature assembly: stationarity transforms, lag windows, source alignment,
//! training-range scaling.

pub mod assembler;
pub mod row;
pub mod scaler;
pub mod spec;
pub mod transforms;

pub use assembler::{require_fresh, AssemblyOutcome, FeatureAssembler, LoadedSources};
pub use row::{FeatureRow, FeatureSnapshot, RowBuilder, RowOutcome, UnscaledRow};
pub use scaler::{ChannelParams, Scaler, RETURN_CHANNEL};
pub use spec::FeatureSpec;
pub use transforms::{lag_window, pct_returns, reconstruct_prices, LagWindow};

use serde::{Deserialize, Serialize};

/// Scaler family. Closed set; unknown names fail config parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    ZScore,
    MinMax,
}

/// What the target column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Percent return on the target day.
    Return,
    /// Closing price on the target day.
    Close,
}
