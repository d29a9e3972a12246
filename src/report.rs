//! Run artifact assembly and export
//!
//! A `RunReport` is built once from a terminal run and never changes after
//! that. It is what gets written to disk, stored, and printed.

use chrono::{DateTime, Utc};
use csv::Writer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{OptimizerError, OptimizerResult};
use crate::expander::ParameterSpace;
use crate::overfitting::OverfittingAssessment;
use crate::ranking::{RankedResult, RankingEngine};
use crate::run::OptimizationRun;
use crate::types::{
    Combination, DateRange, Direction, EvaluationOutcome, Metric, Phase, RunStatus,
};

/// Train and test outcomes of one combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationReport {
    pub combination: Combination,
    pub train: Option<EvaluationOutcome>,
    pub test: Option<EvaluationOutcome>,
    pub overfitting: Option<OverfittingAssessment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub workers: usize,
    pub train_succeeded: usize,
    pub train_failed: usize,
    pub test_succeeded: usize,
    pub test_failed: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub strategy: String,
    pub status: RunStatus,
    pub target: Metric,
    pub direction: Direction,
    pub parameter_space: ParameterSpace,
    pub total_combinations: usize,
    pub symbols: Vec<String>,
    pub window: DateRange,
    pub train_period: DateRange,
    pub test_period: Option<DateRange>,
    pub selected_for_test: Vec<usize>,
    pub results: Vec<CombinationReport>,
    pub leaderboard: Vec<RankedResult>,
    pub low_confidence: bool,
    pub warnings: Vec<String>,
    pub failure_reason: Option<String>,
    pub metadata: RunMetadata,
}

impl RunReport {
    /// Build the artifact for a terminal run. An empty leaderboard is recorded
    /// as a warning rather than an error.
    pub fn assemble(
        run: &OptimizationRun,
        engine: &RankingEngine,
        top_n: usize,
    ) -> OptimizerResult<Self> {
        if !run.is_terminal() {
            return Err(OptimizerError::RunNotTerminal(run.id().to_string()));
        }

        let mut warnings = run.warnings().to_vec();
        let leaderboard = match engine.leaderboard(run, top_n) {
            Ok(board) => board,
            Err(e @ OptimizerError::EmptyResultSet(_)) => {
                warn!(run = run.id(), "{}", e);
                let message = e.to_string();
                if !warnings.contains(&message) {
                    warnings.push(message);
                }
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let target = run.target();
        let detector = engine.detector();
        let results = run
            .combinations()
            .iter()
            .map(|combo| {
                let overfitting = match (run.train_metrics(combo.index), run.test_metrics(combo.index)) {
                    (Some(train), Some(test)) => match (train.get(target), test.get(target)) {
                        (Some(tr), Some(te)) => Some(detector.assess(tr, te, target)),
                        _ => None,
                    },
                    _ => None,
                };
                CombinationReport {
                    combination: combo.clone(),
                    train: run.outcome(Phase::Train, combo.index).cloned(),
                    test: run.outcome(Phase::Test, combo.index).cloned(),
                    overfitting,
                }
            })
            .collect();

        Ok(RunReport {
            run_id: run.id().to_string(),
            strategy: run.strategy().to_string(),
            status: run.status(),
            target,
            direction: run.direction(),
            parameter_space: run.space().clone(),
            total_combinations: run.total_combinations(),
            symbols: run.symbols().to_vec(),
            window: run.window(),
            train_period: run.train_period(),
            test_period: run.test_period(),
            selected_for_test: run.selected().to_vec(),
            results,
            leaderboard,
            low_confidence: run.low_confidence(),
            warnings,
            failure_reason: run.failure_reason().map(str::to_string),
            metadata: RunMetadata {
                started_at: run.started_at(),
                finished_at: run.finished_at(),
                duration_secs: run.duration_secs(),
                workers: run.workers(),
                train_succeeded: run.success_count(Phase::Train),
                train_failed: run.failure_count(Phase::Train),
                test_succeeded: run.success_count(Phase::Test),
                test_failed: run.failure_count(Phase::Test),
                generated_at: Utc::now(),
            },
        })
    }

    /// Write the full artifact as `{dir}/{run_id}.json`
    pub fn write_json(&self, dir: impl AsRef<Path>) -> OptimizerResult<PathBuf> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{}.json", self.run_id));
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Run report written to {}", path.display());
        Ok(path)
    }

    /// Write the leaderboard as `{dir}/{run_id}_leaderboard.csv`
    pub fn write_leaderboard_csv(&self, dir: impl AsRef<Path>) -> OptimizerResult<PathBuf> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{}_leaderboard.csv", self.run_id));

        let mut wtr = Writer::from_path(&path)?;
        wtr.write_record([
            "rank",
            "combination",
            "params",
            "composite_score",
            "sharpe_ratio",
            "win_rate",
            "max_drawdown",
            "total_trades",
            "test_target",
            "overfitting_ratio",
            "overfitting_class",
            "low_confidence",
        ])?;

        let fmt_opt = |v: Option<f64>| v.map(|v| format!("{:.6}", v)).unwrap_or_default();
        for r in &self.leaderboard {
            wtr.write_record([
                r.rank.to_string(),
                r.combination.index.to_string(),
                r.combination.to_string(),
                format!("{:.6}", r.composite_score),
                fmt_opt(r.train_metrics.get(Metric::SharpeRatio)),
                fmt_opt(r.train_metrics.get(Metric::WinRate)),
                fmt_opt(r.train_metrics.get(Metric::MaxDrawdown)),
                fmt_opt(r.train_metrics.get(Metric::TotalTrades)),
                fmt_opt(r.test_metrics.as_ref().and_then(|m| m.get(self.target))),
                fmt_opt(r.overfitting.and_then(|o| o.ratio)),
                r.overfitting
                    .map(|o| o.classification.to_string())
                    .unwrap_or_default(),
                r.low_confidence.to_string(),
            ])?;
        }
        wtr.flush()?;

        info!("Leaderboard written to {}", path.display());
        Ok(path)
    }

    /// Console leaderboard
    pub fn print_leaderboard(&self) {
        let m = &self.metadata;
        println!("\n{}", "=".repeat(120));
        println!(
            "RUN {} | {} | {} | target {} ({})",
            self.run_id, self.strategy, self.status, self.target, self.direction
        );
        println!("{}", "=".repeat(120));
        println!(
            "  Combinations:  {} ({} ok / {} failed on train)",
            self.total_combinations, m.train_succeeded, m.train_failed
        );
        println!("  Train window:  {}", self.train_period);
        match self.test_period {
            Some(test) => println!(
                "  Test window:   {} ({} re-tested, {} ok / {} failed)",
                test,
                self.selected_for_test.len(),
                m.test_succeeded,
                m.test_failed
            ),
            None => println!("  Test window:   none (single phase)"),
        }
        println!(
            "  Workers:       {}   Duration: {}",
            m.workers,
            m.duration_secs
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_else(|| "-".to_string())
        );
        if let Some(reason) = &self.failure_reason {
            println!("  Failure:       {}", reason);
        }
        for w in &self.warnings {
            println!("  ⚠ {}", w);
        }

        if self.leaderboard.is_empty() {
            println!("{}", "=".repeat(120));
            return;
        }

        println!("{}", "-".repeat(120));
        println!(
            "{:<4} {:>7} {:>7} {:>7} {:>8} {:>6} | {:>8} {:>6} {:<17} | Parameters",
            "Rank", "Score", "Sharpe", "WinR%", "MaxDD%", "Trades", "Test", "Ratio", "Overfitting"
        );
        println!("{}", "-".repeat(120));

        for r in &self.leaderboard {
            let t = &r.train_metrics;
            let test = r
                .test_metrics
                .as_ref()
                .and_then(|m| m.get(self.target))
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string());
            let ratio = r
                .overfitting
                .and_then(|o| o.ratio)
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string());
            let class = r
                .overfitting
                .map(|o| o.classification.to_string())
                .unwrap_or_else(|| "-".to_string());

            println!(
                "{:<4} {:>7.3} {:>7.2} {:>7.2} {:>8.2} {:>6.0} | {:>8} {:>6} {:<17} | {}",
                r.rank,
                r.composite_score,
                t.value_or_zero(Metric::SharpeRatio),
                t.value_or_zero(Metric::WinRate),
                t.value_or_zero(Metric::MaxDrawdown),
                t.value_or_zero(Metric::TotalTrades),
                test,
                ratio,
                class,
                r.combination
            );
        }
        println!("{}", "=".repeat(120));
    }
}
