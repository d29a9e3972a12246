//! Configuration management
//!
//! Loads the JSON configuration file. Every section has defaults, so a partial
//! (or empty) file is valid. The evaluation service URL and database path can
//! be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evaluation::{CircuitBreakerConfig, RetryPolicy};
use crate::expander::DEFAULT_MAX_COMBINATIONS;
use crate::overfitting::{OverfittingDetector, DEFAULT_OVERFITTING_THRESHOLD};
use crate::ranking::{RankingConfig, RankingEngine};
use crate::split::{DEFAULT_MIN_TEST_DAYS, DEFAULT_RETEST_TOP};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub evaluation: EvaluationConfig,
    pub optimizer: OptimizerConfig,
    pub ranking: RankingConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file {}", path.as_ref().display())
        })?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        Ok(config)
    }

    /// File if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let mut config = Config::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("EVAL_SERVICE_URL") {
            self.evaluation.service_url = url;
        }
        if let Ok(db_path) = std::env::var("OPTIMIZER_DB_PATH") {
            self.storage.db_path = db_path;
        }
    }

    pub fn ranking_engine(&self) -> RankingEngine {
        RankingEngine::new(
            self.ranking.clone(),
            OverfittingDetector::new(self.optimizer.overfitting_threshold),
        )
    }
}

/// Evaluation service connection and call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub service_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        EvaluationConfig {
            service_url: "http://127.0.0.1:8000".to_string(),
            timeout_secs: 120,
            max_retries: 2,
            backoff_base_ms: 500,
            circuit_failure_threshold: 10,
            circuit_cooldown_secs: 30,
        }
    }
}

impl EvaluationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_timeout(self.timeout())
            .with_max_retries(self.max_retries)
            .with_backoff_base(Duration::from_millis(self.backoff_base_ms))
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.circuit_failure_threshold)
            .with_cooldown(Duration::from_secs(self.circuit_cooldown_secs))
    }
}

/// Search and validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// `None` uses the available parallelism
    pub workers: Option<usize>,
    pub max_combinations: usize,
    /// `None` runs a single phase over the full window
    pub split_ratio: Option<f64>,
    pub retest_top: usize,
    pub overfitting_threshold: f64,
    pub min_test_days: i64,
    pub top_n: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            workers: None,
            max_combinations: DEFAULT_MAX_COMBINATIONS,
            split_ratio: None,
            retest_top: DEFAULT_RETEST_TOP,
            overfitting_threshold: DEFAULT_OVERFITTING_THRESHOLD,
            min_test_days: DEFAULT_MIN_TEST_DAYS,
            top_n: 10,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub results_dir: String,
    /// Refresh a JSON dump of the run list after every append
    pub json_backup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: "data/optimizer.db".to_string(),
            results_dir: "results".to_string(),
            json_backup: false,
        }
    }
}

impl StorageConfig {
    pub fn json_backup_path(&self) -> Option<PathBuf> {
        self.json_backup
            .then(|| PathBuf::from(&self.results_dir).join("run_history.json"))
    }
}
