//! IbexLab Core: the data side of the IBEX banks forecasting pipeline.
//!
//! Stages, in dependency order:
//! - Raw ingestion from a provider into immutable Parquet snapshots
//! - Integrity validation (gaps, duplicates, out-of-range bars)
//! - Exogenous event columns and forward-filled macro columns
//! - Feature assembly: returns, lag windows, training-range scaling
//! - Scenario inference against exported model readouts
//!
//! Every stage commits its outputs to the [`store`] and appends one record to
//! the [`lineage`] log.

pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod exogenous;
pub mod features;
pub mod integrity;
pub mod lineage;
pub mod macro_series;
pub mod model;
pub mod scenario;
pub mod store;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Stage outputs cross rayon worker threads in the runner.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::PriceBar>();
        require_sync::<domain::PriceBar>();
        require_send::<domain::PriceSeries>();
        require_sync::<domain::PriceSeries>();
        require_send::<domain::TradingCalendar>();
        require_sync::<domain::TradingCalendar>();

        require_send::<integrity::ValidationReport>();
        require_sync::<integrity::ValidationReport>();
        require_send::<integrity::IntegrityValidator>();
        require_sync::<integrity::IntegrityValidator>();
        require_send::<exogenous::EventColumn>();
        require_sync::<exogenous::EventColumn>();
        require_send::<macro_series::MacroColumn>();
        require_sync::<macro_series::MacroColumn>();
        require_send::<features::FeatureSnapshot>();
        require_sync::<features::FeatureSnapshot>();
        require_send::<features::Scaler>();
        require_sync::<features::Scaler>();

        require_send::<store::ArtifactStore>();
        require_sync::<store::ArtifactStore>();
        require_send::<lineage::LineageLog>();
        require_sync::<lineage::LineageLog>();
        require_send::<lineage::LineageRecord>();
        require_sync::<lineage::LineageRecord>();

        require_send::<model::ModelArtifact>();
        require_sync::<model::ModelArtifact>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
    }

    /// The assembler is shared by reference across per-ticker workers.
    #[test]
    fn assembler_is_shareable_across_threads() {
        fn require_sync<T: Sync>() {}
        require_sync::<features::FeatureAssembler<'static>>();
    }

    #[test]
    fn every_error_maps_to_a_kind() {
        let err = PipelineError::InvalidScenario("x".into());
        assert_eq!(err.kind(), ErrorKind::Scenario);
    }
}
