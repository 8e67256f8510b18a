//! IbexLab Runner: orchestration on top of `ibexlab-core`.
//!
//! - Per-ticker parallel runs with halt reports
//! - Evaluation metrics per (ticker, architecture)
//! - Text and JSON run reports

pub mod evaluation;
pub mod outcome;
pub mod pipeline;
pub mod report;

pub use evaluation::{evaluate_ticker, EvaluationOutcome, ForecastMetrics, MetricsReport, ModelMetrics};
pub use outcome::{CompletedTicker, HaltReport, PipelineReport, TickerOutcome};
pub use pipeline::{DownloadOptions, Pipeline};
pub use report::{render_chain, render_metrics, render_pipeline, write_report_json};
