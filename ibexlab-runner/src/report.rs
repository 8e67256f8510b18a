//! Human-readable renderings and JSON export of run results.

use anyhow::{Context, Result};
use ibexlab_core::lineage::LineageRecord;
use std::fmt::Write as _;
use std::path::Path;

use crate::evaluation::MetricsReport;
use crate::outcome::{PipelineReport, TickerOutcome};

/// One line per ticker, then a section per halt with its lineage chain.
pub fn render_pipeline(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "config {}", report.config_hash.short());
    let _ = writeln!(
        out,
        "events: {}  macro: {}",
        list_or_none(&report.event_columns),
        list_or_none(&report.macro_columns)
    );
    out.push('\n');

    let _ = writeln!(out, "{:<10} {:<10} {:>7} {:>7}  detail", "ticker", "status", "rows", "drops");
    for t in &report.tickers {
        match t {
            TickerOutcome::Completed(c) => {
                let _ = writeln!(
                    out,
                    "{:<10} {:<10} {:>7} {:>7}  {}",
                    c.ticker, "ok", c.rows, c.dropped, c.snapshot_key
                );
            }
            TickerOutcome::Halted(h) => {
                let _ = writeln!(
                    out,
                    "{:<10} {:<10} {:>7} {:>7}  {}: {}",
                    h.ticker, "HALTED", "-", "-", h.stage, h.message
                );
            }
        }
    }

    for h in report.halted() {
        let _ = writeln!(out, "\n{} halted at {} ({:?})", h.ticker, h.stage, h.kind);
        out.push_str(&render_chain(&h.chain));
    }
    out
}

/// Lineage records oldest first, one line each.
pub fn render_chain(chain: &[LineageRecord]) -> String {
    if chain.is_empty() {
        return "  (no lineage)\n".to_string();
    }
    let mut out = String::new();
    for r in chain {
        let _ = write!(
            out,
            "  {} {:<18} in={} out={}",
            r.run_id,
            r.stage_name.as_str(),
            r.input_checksums.len(),
            r.output_checksums.len()
        );
        if !r.drops.is_empty() {
            let _ = write!(out, " drops={}", r.drops.len());
        }
        if let Some(reason) = &r.halted {
            let _ = write!(out, " HALTED: {reason}");
        }
        if r.is_replay() {
            out.push_str(" (replay)");
        }
        out.push('\n');
    }
    out
}

/// Metrics table. Baseline rows are labelled in their own column, and a
/// footnote follows when any appear: every architecture of a ticker without
/// exported models shares one ridge readout.
pub fn render_metrics(reports: &[MetricsReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<6} {:<9} {:>10} {:>10} {:>8} {:>6}",
        "ticker", "model", "source", "rmse", "mae", "r2", "n"
    );
    let mut baseline_tickers = Vec::new();
    for report in reports {
        for m in report.models.values() {
            let _ = writeln!(
                out,
                "{:<10} {:<6} {:<9} {:>10.6} {:>10.6} {:>8.4} {:>6}",
                report.ticker,
                m.architecture,
                if m.baseline { "baseline" } else { "exported" },
                m.metrics.rmse,
                m.metrics.mae,
                m.metrics.r2,
                m.metrics.n,
            );
        }
        if report.models.values().any(|m| m.baseline) {
            baseline_tickers.push(report.ticker.clone());
        }
    }
    if !baseline_tickers.is_empty() {
        let _ = writeln!(
            out,
            "\nbaseline rows are one ridge readout fit on the snapshot, not trained \
             networks; do not compare them across architectures ({})",
            baseline_tickers.join(", ")
        );
    }
    out
}

/// Write `report` as pretty JSON.
pub fn write_report_json(report: &PipelineReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
