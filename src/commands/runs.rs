//! Run history commands: list stored runs and show one leaderboard

use anyhow::{Context, Result};
use tracing::info;

use strategy_optimizer::{Config, RunStore};

fn open_store(config_path: &str) -> Result<RunStore> {
    let config = Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    RunStore::new(&config.storage.db_path, None)
        .with_context(|| format!("Failed to open run store {}", config.storage.db_path))
}

pub fn list(config_path: String, limit: usize) -> Result<()> {
    let store = open_store(&config_path)?;
    let runs = store.list_runs(limit)?;
    info!("Listing {} stored runs", runs.len());

    if runs.is_empty() {
        println!("No stored runs.");
        return Ok(());
    }

    println!("\n{}", "=".repeat(120));
    println!(
        "{:<16} {:<16} {:<10} {:<13} {:>6} {:>6} {:>7} {:<25} | Best",
        "Run", "Strategy", "Status", "Target", "Combos", "Failed", "Score", "Started"
    );
    println!("{}", "-".repeat(120));
    for r in &runs {
        println!(
            "{:<16} {:<16} {:<10} {:<13} {:>6} {:>6} {:>7} {:<25} | {}{}",
            r.run_id,
            r.strategy,
            r.status,
            r.target,
            r.total_combinations,
            r.train_failed,
            r.best_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".to_string()),
            r.started_at,
            r.best_params.as_deref().unwrap_or("-"),
            if r.low_confidence { " (low confidence)" } else { "" }
        );
    }
    println!("{}", "=".repeat(120));
    Ok(())
}

pub fn show(config_path: String, run_id: String, all: bool) -> Result<()> {
    let store = open_store(&config_path)?;
    let report = store
        .load_report(&run_id)?
        .with_context(|| format!("No stored run with id {}", run_id))?;
    report.print_leaderboard();

    if all {
        let results = store.results_for_run(&run_id)?;
        println!("\n{:<6} {:<8} {:<8} {:>7} {:<17} | Parameters", "Index", "Train", "Test", "Ratio", "Overfitting");
        println!("{}", "-".repeat(80));
        for r in &results {
            println!(
                "{:<6} {:<8} {:<8} {:>7} {:<17} | {}",
                r.combination_index,
                r.train_status.as_deref().unwrap_or("-"),
                r.test_status.as_deref().unwrap_or("-"),
                r.overfitting_ratio
                    .map(|v| format!("{:.2}", v))
                    .unwrap_or_else(|| "-".to_string()),
                r.overfitting_class.as_deref().unwrap_or("-"),
                r.params
            );
        }
    }
    Ok(())
}
