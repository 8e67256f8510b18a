//! IbexLab CLI: build, inspect and query the banks forecasting pipeline.
//!
//! Commands:
//! - `run` - every stage for the configured universe
//! - `download` - fetch raw quotes into the artifact store
//! - `validate` - integrity checks and the summary CSV
//! - `build-features` - event table, macro columns, feature snapshots
//! - `evaluate` - rmse/mae/r2 per (ticker, architecture)
//! - `simulate` - what-if prediction with event flags forced on or off
//! - `lineage` - causal chain of an artifact or a run

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use ibexlab_core::data::{provider_from_config, LogProgress};
use ibexlab_core::domain::RunId;
use ibexlab_core::integrity::ValidationStatus;
use ibexlab_core::model::Architecture;
use ibexlab_core::scenario::{run_scenario, ScenarioRequest};
use ibexlab_runner::{
    render_chain, render_metrics, render_pipeline, write_report_json, DownloadOptions, Pipeline,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ibexlab",
    about = "IbexLab: lineage-tracked feature pipeline for IBEX bank forecasting"
)]
struct Cli {
    /// Pipeline config file.
    #[arg(long, global = true, default_value = "config/pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion, validation, source building and feature assembly.
    Run {
        /// Re-fetch raw quotes even when a snapshot for the range exists.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Also evaluate every architecture on the test range.
        #[arg(long, default_value_t = false)]
        evaluate: bool,

        /// Write the run report as JSON to this path.
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Fetch raw quotes. Defaults to the whole universe.
    Download {
        symbols: Vec<String>,

        /// Re-fetch even when a snapshot for the range exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Validate committed raw snapshots. Defaults to the whole universe.
    Validate { symbols: Vec<String> },
    /// Build event and macro columns, then assemble feature snapshots.
    BuildFeatures {
        /// Tickers to assemble. Defaults to the configured targets.
        tickers: Vec<String>,
    },
    /// Score every configured architecture on held-out rows.
    Evaluate { tickers: Vec<String> },
    /// Predict with event flags forced to 0 or 1 on one date.
    Simulate {
        #[arg(long)]
        ticker: String,

        /// Base date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Model architecture: rnn, lstm or gru.
        #[arg(long, default_value = "lstm")]
        model: String,

        /// Event override as COLUMN=0|1 (column name or category). Repeatable.
        #[arg(long = "override", value_name = "COLUMN=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the lineage chain behind an artifact or a run.
    Lineage {
        /// Artifact key, e.g. features/ticker=BBVA.MC/config=<hash>.
        #[arg(long, conflicts_with = "run")]
        artifact: Option<String>,

        /// Run id from a lineage record.
        #[arg(long)]
        run: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let pipeline = Pipeline::from_file(&cli.config)?;

    match cli.command {
        Commands::Run {
            force,
            evaluate,
            json,
        } => run_all(&pipeline, force, evaluate, json),
        Commands::Download { symbols, force } => run_download(&pipeline, symbols, force),
        Commands::Validate { symbols } => run_validate(&pipeline, symbols),
        Commands::BuildFeatures { tickers } => run_build_features(&pipeline, tickers),
        Commands::Evaluate { tickers } => run_evaluate(&pipeline, tickers),
        Commands::Simulate {
            ticker,
            date,
            model,
            overrides,
        } => run_simulate(&pipeline, ticker, &date, &model, &overrides),
        Commands::Lineage { artifact, run } => run_lineage(&pipeline, artifact, run),
    }
}

fn or_universe(pipeline: &Pipeline, symbols: Vec<String>) -> Vec<String> {
    if symbols.is_empty() {
        pipeline.config().universe.all_symbols()
    } else {
        symbols
    }
}

fn or_targets(pipeline: &Pipeline, tickers: Vec<String>) -> Vec<String> {
    if tickers.is_empty() {
        pipeline.targets()
    } else {
        tickers
    }
}

fn run_all(pipeline: &Pipeline, force: bool, evaluate: bool, json: Option<PathBuf>) -> Result<()> {
    let provider = provider_from_config(pipeline.config())?;
    let report = pipeline.run(
        provider.as_ref(),
        &LogProgress,
        DownloadOptions { force },
        Utc::now(),
    )?;
    print!("{}", render_pipeline(&report));

    if let Some(path) = json {
        write_report_json(&report, &path)?;
        println!("Report written to: {}", path.display());
    }

    if evaluate {
        let completed: Vec<String> = report
            .completed()
            .map(|c| c.ticker.clone())
            .filter(|t| pipeline.targets().contains(t))
            .collect();
        println!();
        run_evaluate(pipeline, completed)?;
    }

    if report.halted().next().is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_download(pipeline: &Pipeline, symbols: Vec<String>, force: bool) -> Result<()> {
    let provider = provider_from_config(pipeline.config())?;
    let symbols = or_universe(pipeline, symbols);
    let results = pipeline.download(
        provider.as_ref(),
        &LogProgress,
        &symbols,
        DownloadOptions { force },
    );

    let mut failed = 0;
    for (symbol, result) in &results {
        match result {
            Ok(Some(out)) => println!(
                "{symbol}: {} rows ({} discarded) -> {}",
                out.rows, out.discarded, out.write.key
            ),
            Ok(None) => println!("{symbol}: up to date"),
            Err(e) => {
                eprintln!("Error for {symbol}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_validate(pipeline: &Pipeline, symbols: Vec<String>) -> Result<()> {
    let symbols = or_universe(pipeline, symbols);
    let results = pipeline.validate(&symbols)?;

    println!(
        "{:<10} {:>6} {:>6} {:>6} {:>6} {:>6}  status",
        "ticker", "rows", "dups", "range", "gaps", "filled"
    );
    let mut failed = 0;
    for (symbol, result) in &results {
        match result {
            Ok(out) => {
                let r = &out.report;
                println!(
                    "{:<10} {:>6} {:>6} {:>6} {:>6} {:>6}  {:?}",
                    symbol,
                    r.rows,
                    r.duplicate_count,
                    r.out_of_range_count,
                    r.gap_dates.len(),
                    r.filled_count,
                    r.status
                );
                if r.status == ValidationStatus::Fail {
                    println!("           {}", r.fail_reasons.join("; "));
                    failed += 1;
                }
            }
            Err(e) => {
                eprintln!("Error for {symbol}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_build_features(pipeline: &Pipeline, tickers: Vec<String>) -> Result<()> {
    let (events, macros) = pipeline.build_sources()?;
    println!(
        "events: {} column(s), macro: {} column(s)",
        events.columns.len(),
        macros.columns.len()
    );

    let tickers = or_targets(pipeline, tickers);
    let mut failed = 0;
    for (ticker, result) in pipeline.build_features(&tickers, Utc::now())? {
        match result {
            Ok(out) => println!(
                "{ticker}: {} rows, {} dropped -> {}",
                out.snapshot.rows.len(),
                out.snapshot.drops.len(),
                out.snapshot_write.key
            ),
            Err(e) => {
                eprintln!("{ticker}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_evaluate(pipeline: &Pipeline, tickers: Vec<String>) -> Result<()> {
    let tickers = or_targets(pipeline, tickers);
    let mut reports = Vec::new();
    let mut failed = 0;
    for (ticker, result) in pipeline.evaluate(&tickers)? {
        match result {
            Ok(out) => reports.push(out.report),
            Err(e) => {
                eprintln!("{ticker}: {e}");
                failed += 1;
            }
        }
    }
    print!("{}", render_metrics(&reports));
    for report in &reports {
        if let Some(best) = report.best() {
            println!("{}: best {} (rmse {:.6})", report.ticker, best.architecture, best.metrics.rmse);
        }
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_overrides(raw: &[String]) -> Result<BTreeMap<String, u8>> {
    let mut overrides = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("override '{item}' must look like COLUMN=0 or COLUMN=1");
        };
        let value: u8 = value
            .trim()
            .parse()
            .with_context(|| format!("override '{item}' has a non-numeric value"))?;
        if overrides.insert(key.trim().to_string(), value).is_some() {
            bail!("override for '{key}' given twice");
        }
    }
    Ok(overrides)
}

fn run_simulate(
    pipeline: &Pipeline,
    ticker: String,
    date: &str,
    model: &str,
    overrides: &[String],
) -> Result<()> {
    let base_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{date}', expected YYYY-MM-DD"))?;
    let architecture: Architecture = model.parse()?;
    let request = ScenarioRequest {
        model_id: format!("{ticker}:{architecture}"),
        ticker,
        base_date,
        overrides: parse_overrides(overrides)?,
    };

    let assembler = pipeline.assembler()?;
    let outcome = run_scenario(&assembler, &request, Utc::now())?;
    let result = &outcome.result;

    println!("{} {} on {}", result.ticker, result.model_id, result.base_date);
    println!("  base prediction:   {:.6}", result.base_prediction);
    println!("  scenario:          {:.6}", result.predicted_value);
    println!(
        "  95% band:          [{:.6}, {:.6}]",
        result.confidence_band.0, result.confidence_band.1
    );
    if result.changed.is_empty() {
        println!("  no event column changed value");
    } else {
        println!("  changed:           {}", result.changed.join(", "));
    }
    println!("  run:               {}", outcome.record.run_id);
    Ok(())
}

fn run_lineage(pipeline: &Pipeline, artifact: Option<String>, run: Option<String>) -> Result<()> {
    let chain = match (artifact, run) {
        (Some(key), None) => pipeline.lineage().causal_chain(&key)?,
        (None, Some(run)) => pipeline.lineage().chain_for_run(&RunId(run))?,
        _ => bail!("one of --artifact or --run is required"),
    };
    if chain.is_empty() {
        bail!("no lineage records found");
    }
    print!("{}", render_chain(&chain));
    Ok(())
}
