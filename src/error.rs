//! Error types for the optimization engine
//!
//! Two families live here. `OptimizerError` covers run-level failures that reach
//! the caller. `EvaluationError` covers a single call to the evaluation service
//! and never leaves the evaluation adapter: it is folded into a failure outcome.

use std::time::Duration;
use thiserror::Error;

use crate::types::RunStatus;

/// Run-level errors surfaced to the caller
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// Malformed parameter specification
    #[error("Invalid parameter specification: {0}")]
    ParameterParse(String),

    /// Combination count exceeds the configured ceiling
    #[error("Parameter space expands to {total} combinations, exceeding the ceiling of {ceiling}")]
    CombinationExplosion { total: String, ceiling: usize },

    /// Every combination failed or none survived the ranking filters
    #[error("No rankable results: {0}")]
    EmptyResultSet(String),

    /// Metric name outside the known catalogue
    #[error("Unknown metric: '{0}'")]
    UnknownMetric(String),

    /// Split ratio or date window cannot produce two non-empty windows
    #[error("Invalid train/test split: {0}")]
    InvalidSplit(String),

    /// Lifecycle violation on an optimization run
    #[error("Invalid run status transition: {from} -> {to}")]
    InvalidStatusTransition { from: RunStatus, to: RunStatus },

    /// Reports and rankings need a run that has finished
    #[error("Run {0} has not reached a terminal status")]
    RunNotTerminal(String),

    /// A run in a terminal state is immutable
    #[error("Run {id} is {status} and can no longer change")]
    RunSealed { id: String, status: RunStatus },

    /// The persistent store rejected the operation
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Artifact could not be encoded or decoded
    #[error("Artifact serialization error: {0}")]
    Artifact(#[from] serde_json::Error),

    /// Leaderboard export failed
    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Failure of a single evaluation service call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The call did not finish within the per-call timeout
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// Service could not be reached at all
    #[error("evaluation service unavailable: {0}")]
    Unavailable(String),

    /// Infrastructure hiccup worth retrying (throttling, 5xx)
    #[error("transient evaluation failure: {0}")]
    Transient(String),

    /// The service refused this request; retrying cannot change the answer
    #[error("evaluation rejected: {0}")]
    Rejected(String),

    /// The service answered with something that is not a metric bundle
    #[error("invalid evaluation response: {0}")]
    InvalidResponse(String),
}

impl EvaluationError {
    /// Whether the retry policy should try again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Unavailable(_) | Self::Transient(_)
        )
    }
}

impl From<reqwest::Error> for EvaluationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transient(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::Unavailable(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
