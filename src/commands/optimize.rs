//! Optimize command: expand, evaluate, validate, rank, report, store

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::{error, info, warn};

use strategy_optimizer::coordinator::{default_workers, CancelToken, ExecutionCoordinator};
use strategy_optimizer::evaluation::{EvaluationClient, HttpEvaluator};
use strategy_optimizer::split::{OptimizationRequest, SplitController};
use strategy_optimizer::{Config, DateRange, Direction, Metric, RunReport, RunStatus, RunStore};

#[derive(Args, Debug)]
pub struct OptimizeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/optimizer.json")]
    pub config: String,

    /// Strategy identifier understood by the evaluation service
    #[arg(short, long)]
    pub strategy: String,

    /// Parameter specification. E.g., "fast:5,8,13;slow:21,34;use_filter:true,false"
    #[arg(short, long)]
    pub params: String,

    /// Target metric (sharpe, sortino, return, drawdown, win_rate, trades, profit_factor, calmar, expectancy)
    #[arg(short, long, default_value = "sharpe")]
    pub target: Metric,

    /// Optimization direction (maximize, minimize). Defaults to the metric's natural direction
    #[arg(short, long)]
    pub direction: Option<Direction>,

    /// Window start (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub start: NaiveDate,

    /// Window end (YYYY-MM-DD, exclusive)
    #[arg(long)]
    pub end: NaiveDate,

    /// Symbols to evaluate (comma-separated). E.g., "BTCUSDT,ETHUSDT"
    #[arg(long, default_value = "")]
    pub symbols: String,

    /// Train/test split ratio in (0, 1), overrides config
    #[arg(long)]
    pub split: Option<f64>,

    /// Run a single phase over the whole window even if the config sets a split
    #[arg(long, conflicts_with = "split")]
    pub no_split: bool,

    /// Overfitting threshold, overrides config
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Worker pool size, overrides config
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Leaderboard size, overrides config
    #[arg(long)]
    pub top: Option<usize>,

    /// Evaluation service URL, overrides config and EVAL_SERVICE_URL
    #[arg(long)]
    pub service_url: Option<String>,

    /// Skip writing the run to the database
    #[arg(long)]
    pub no_store: bool,
}

fn parse_symbols(s: &str) -> Vec<String> {
    s.split(',')
        .map(|sym| sym.trim().to_uppercase())
        .filter(|sym| !sym.is_empty())
        .collect()
}

pub fn run(args: OptimizeArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(args))
}

async fn run_async(args: OptimizeArgs) -> Result<()> {
    info!("Starting optimization");

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    info!("Loaded configuration from: {}", args.config);

    if let Some(url) = args.service_url {
        config.evaluation.service_url = url;
    }
    if let Some(split) = args.split {
        config.optimizer.split_ratio = Some(split);
    }
    if args.no_split {
        config.optimizer.split_ratio = None;
    }
    if let Some(threshold) = args.threshold {
        config.optimizer.overfitting_threshold = threshold;
    }
    if let Some(top) = args.top {
        config.optimizer.top_n = top;
    }
    let workers = args
        .workers
        .or(config.optimizer.workers)
        .unwrap_or_else(default_workers)
        .max(1);

    let window = DateRange::new(args.start, args.end)?;
    let request = OptimizationRequest::new(args.strategy, args.params, args.target, window)
        .with_direction(args.direction.unwrap_or(args.target.natural_direction()))
        .with_symbols(parse_symbols(&args.symbols))
        .with_split_ratio(config.optimizer.split_ratio)
        .with_retest_top(config.optimizer.retest_top)
        .with_max_combinations(config.optimizer.max_combinations)
        .with_min_test_days(config.optimizer.min_test_days);

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Strategy:      {}", request.strategy);
    println!("  Parameters:    {}", request.spec);
    println!("  Target:        {} ({})", request.target, request.direction);
    println!("  Window:        {}", window);
    match request.split_ratio {
        Some(r) => println!("  Split:         {:.0}% train / {:.0}% test", r * 100.0, (1.0 - r) * 100.0),
        None => println!("  Split:         none (single phase)"),
    }
    let engine = config.ranking_engine();
    println!("  Overfitting:   ratio < {:.2} is high overfitting", engine.detector().threshold());
    println!("  Workers:       {}", workers);
    println!("  Service:       {}", config.evaluation.service_url);
    println!("{}\n", "=".repeat(70));

    let evaluator = HttpEvaluator::new(&config.evaluation.service_url, config.evaluation.timeout())?;
    let client = Arc::new(EvaluationClient::new(
        evaluator,
        config.evaluation.retry_policy(),
        config.evaluation.circuit_breaker(),
    ));

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█░ "),
    );

    let cancel = CancelToken::new();
    let coordinator = ExecutionCoordinator::new(client, workers)
        .with_cancel_token(cancel.clone())
        .with_progress_bar(pb.clone());
    let controller = SplitController::new(coordinator);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, finishing in-flight evaluations...");
                eprintln!("\nCancelling: waiting for in-flight evaluations to finish");
                cancel.cancel();
            }
            Err(e) => error!("Error setting up signal handler: {}", e),
        }
    });

    let run = controller.run(&request).await?;
    pb.finish_with_message(format!("run {}", run.status()));
    println!();

    let report = RunReport::assemble(&run, &engine, config.optimizer.top_n)?;
    report.print_leaderboard();

    let json_path = report.write_json(&config.storage.results_dir)?;
    let csv_path = report.write_leaderboard_csv(&config.storage.results_dir)?;
    println!("\n  Report:      {}", json_path.display());
    println!("  Leaderboard: {}", csv_path.display());

    if !args.no_store {
        let store = RunStore::new(&config.storage.db_path, config.storage.json_backup_path())
            .with_context(|| format!("Failed to open run store {}", config.storage.db_path))?;
        store.append_report(&report).with_context(|| {
            format!(
                "Failed to store run {}; the report is kept at {}",
                report.run_id,
                json_path.display()
            )
        })?;
        println!("  Stored as:   {}", report.run_id);
    }

    match run.status() {
        RunStatus::Completed => info!("Optimization completed successfully"),
        RunStatus::Cancelled => warn!("Optimization cancelled, partial results reported"),
        RunStatus::Failed => {
            anyhow::bail!(
                "Optimization failed: {}",
                run.failure_reason().unwrap_or("unknown reason")
            )
        }
        other => warn!("Optimization ended in unexpected status {}", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        assert_eq!(parse_symbols(" btcusdt, ETHUSDT ,,"), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(parse_symbols("").is_empty());
    }
}
