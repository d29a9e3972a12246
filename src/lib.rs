//! Strategy Parameter Optimizer
//!
//! Grid-searches the tunable parameters of a trading strategy against an
//! external evaluation (backtest) service, validates the winners on a held-out
//! test window, flags overfitting, and ranks configurations by a weighted
//! composite score.
//!
//! Pipeline:
//! - `expander`: parameter specification into typed, indexed combinations
//! - `evaluation`: service seam with timeout, retry and circuit breaker
//! - `coordinator`: bounded-concurrency batch execution with progress and cancellation
//! - `split`: train/test windows and the two-phase protocol
//! - `overfitting`: train vs test generalization classification
//! - `ranking`: composite score leaderboard
//! - `report` / `store`: run artifact, JSON/CSV export, SQLite history
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use strategy_optimizer::coordinator::ExecutionCoordinator;
//! use strategy_optimizer::evaluation::{EvaluationClient, HttpEvaluator};
//! use strategy_optimizer::split::{OptimizationRequest, SplitController};
//! use strategy_optimizer::{DateRange, Metric, RankingEngine, RunReport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let evaluator = HttpEvaluator::new("http://127.0.0.1:8000", std::time::Duration::from_secs(120))?;
//!     let client = Arc::new(EvaluationClient::with_defaults(evaluator));
//!     let controller = SplitController::new(ExecutionCoordinator::new(client, 8));
//!
//!     let window = DateRange::new("2023-01-01".parse()?, "2024-01-01".parse()?)?;
//!     let request = OptimizationRequest::new("ema_cross", "fast:5,8,13;slow:21,34", Metric::SharpeRatio, window)
//!         .with_split_ratio(Some(0.7));
//!
//!     let run = controller.run(&request).await?;
//!     let report = RunReport::assemble(&run, &RankingEngine::default(), 10)?;
//!     report.print_leaderboard();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod evaluation;
pub mod expander;
pub mod overfitting;
pub mod ranking;
pub mod report;
pub mod run;
pub mod split;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{EvaluationError, OptimizerError, OptimizerResult};
pub use overfitting::{OverfittingAssessment, OverfittingClass, OverfittingDetector};
pub use ranking::{RankedResult, RankingConfig, RankingEngine};
pub use report::RunReport;
pub use run::OptimizationRun;
pub use store::RunStore;
pub use types::*;
