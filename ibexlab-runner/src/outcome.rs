//! Per-ticker outcomes and halt reports.

use chrono::{DateTime, Utc};
use ibexlab_core::domain::ConfigHash;
use ibexlab_core::integrity::ValidationReport;
use ibexlab_core::lineage::{LineageLog, LineageRecord, Stage};
use ibexlab_core::store::ArtifactKey;
use ibexlab_core::{ErrorKind, PipelineError};
use serde::{Deserialize, Serialize};

/// Why a ticker stopped, where, and the lineage that led there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltReport {
    pub ticker: String,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// Record written by the halting stage, when it wrote one.
    pub record: Option<LineageRecord>,
    pub chain: Vec<LineageRecord>,
}

impl HaltReport {
    /// Build a report, resolving the lineage chain from the halting record or,
    /// failing that, from `upstream` (the last artifact the stage read).
    pub fn new(
        lineage: &LineageLog,
        ticker: &str,
        stage: Stage,
        err: &PipelineError,
        record: Option<LineageRecord>,
        upstream: Option<&ArtifactKey>,
    ) -> Self {
        let chain = match (&record, upstream) {
            (Some(r), _) => lineage.chain_for_run(&r.run_id),
            (None, Some(key)) => lineage.causal_chain(&key.id()),
            (None, None) => Ok(Vec::new()),
        };
        let chain = chain.unwrap_or_else(|e| {
            log::warn!("{ticker}: lineage chain unavailable: {e}");
            Vec::new()
        });
        Self {
            ticker: ticker.to_string(),
            stage,
            kind: err.kind(),
            message: err.to_string(),
            record,
            chain,
        }
    }
}

/// Latest halted assembly record for `ticker`, found through its drops.
pub fn find_assembly_halt(lineage: &LineageLog, ticker: &str) -> Option<LineageRecord> {
    let records = lineage.read_all().ok()?;
    records.into_iter().rev().find(|r| {
        r.stage_name == Stage::AssembleFeatures
            && r.halted.is_some()
            && r.drops.iter().any(|d| d.ticker == ticker)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTicker {
    pub ticker: String,
    pub snapshot_key: String,
    pub rows: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickerOutcome {
    Completed(CompletedTicker),
    Halted(HaltReport),
}

impl TickerOutcome {
    pub fn ticker(&self) -> &str {
        match self {
            TickerOutcome::Completed(c) => &c.ticker,
            TickerOutcome::Halted(h) => &h.ticker,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, TickerOutcome::Halted(_))
    }
}

/// Result of one end-to-end run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub config_hash: ConfigHash,
    pub validation: Vec<ValidationReport>,
    pub event_columns: Vec<String>,
    pub macro_columns: Vec<String>,
    /// Every ticker in the universe, references included.
    pub tickers: Vec<TickerOutcome>,
}

impl PipelineReport {
    pub fn halted(&self) -> impl Iterator<Item = &HaltReport> {
        self.tickers.iter().filter_map(|t| match t {
            TickerOutcome::Halted(h) => Some(h),
            TickerOutcome::Completed(_) => None,
        })
    }

    pub fn completed(&self) -> impl Iterator<Item = &CompletedTicker> {
        self.tickers.iter().filter_map(|t| match t {
            TickerOutcome::Completed(c) => Some(c),
            TickerOutcome::Halted(_) => None,
        })
    }

    pub fn outcome(&self, ticker: &str) -> Option<&TickerOutcome> {
        self.tickers.iter().find(|t| t.ticker() == ticker)
    }
}
