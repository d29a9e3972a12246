//! Evaluation client adapter
//!
//! Wraps an `Evaluator` with:
//! - A per-call timeout
//! - Retries for transient failures only, with exponential backoff
//! - A circuit breaker shared by all workers
//!
//! `evaluate` never returns an error. Whatever goes wrong becomes an
//! `EvaluationOutcome::Failure` so one bad combination cannot abort a batch.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::{EvaluationRequest, Evaluator};
use crate::error::EvaluationError;
use crate::types::{
    Combination, DateRange, EvaluationFailure, EvaluationOutcome, FailureKind,
};

/// Timeout and retry policy for evaluation calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound for one call to the service
    pub timeout: Duration,
    /// Extra attempts after the first one, transient failures only
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each following retry
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

pub struct EvaluationClient<E> {
    evaluator: E,
    policy: RetryPolicy,
    circuit_breaker: Mutex<CircuitBreaker>,
}

impl<E: Evaluator> EvaluationClient<E> {
    pub fn new(evaluator: E, policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            evaluator,
            policy,
            circuit_breaker: Mutex::new(CircuitBreaker::new(breaker)),
        }
    }

    /// Client with default policy and breaker settings
    pub fn with_defaults(evaluator: E) -> Self {
        Self::new(evaluator, RetryPolicy::default(), CircuitBreakerConfig::default())
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run-level reachability check, bounded by the per-call timeout
    pub async fn check_service(&self) -> Result<(), EvaluationError> {
        match timeout(self.policy.timeout, self.evaluator.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(EvaluationError::Timeout(self.policy.timeout)),
        }
    }

    /// Evaluate one combination over one period
    pub async fn evaluate(
        &self,
        strategy: &str,
        combination: &Combination,
        period: DateRange,
        symbols: &[String],
    ) -> EvaluationOutcome {
        let request = EvaluationRequest {
            strategy: strategy.to_string(),
            combination: combination.clone(),
            period,
            symbols: symbols.to_vec(),
        };

        let mut attempts = 0u32;
        loop {
            {
                let mut cb = self.circuit_breaker.lock().await;
                if !cb.can_attempt() {
                    return EvaluationOutcome::Failure(EvaluationFailure {
                        kind: FailureKind::CircuitOpen,
                        message: "evaluation service circuit is open".to_string(),
                        attempts,
                    });
                }
            }

            if attempts > 0 {
                let delay = self.policy.backoff(attempts);
                debug!(
                    combination = combination.index,
                    attempt = attempts + 1,
                    "Retrying evaluation after {}ms",
                    delay.as_millis()
                );
                sleep(delay).await;
            }
            attempts += 1;

            let result = match timeout(self.policy.timeout, self.evaluator.evaluate(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(EvaluationError::Timeout(self.policy.timeout)),
            };

            match result {
                Ok(bundle) => {
                    self.circuit_breaker.lock().await.record_success();
                    return EvaluationOutcome::Success(bundle);
                }
                Err(err) if err.is_transient() && attempts <= self.policy.max_retries => {
                    self.circuit_breaker.lock().await.record_retry();
                    warn!(
                        combination = combination.index,
                        "Evaluation failed (attempt {}/{}): {}",
                        attempts,
                        self.policy.max_retries + 1,
                        err
                    );
                }
                Err(err) => {
                    if err.is_transient() {
                        self.circuit_breaker.lock().await.record_failure();
                    } else {
                        // The service answered, so it is reachable
                        self.circuit_breaker.lock().await.record_success();
                    }
                    warn!(
                        combination = combination.index,
                        attempts, "Evaluation failed: {}", err
                    );
                    return EvaluationOutcome::Failure(EvaluationFailure {
                        kind: failure_kind(&err),
                        message: err.to_string(),
                        attempts,
                    });
                }
            }
        }
    }
}

fn failure_kind(err: &EvaluationError) -> FailureKind {
    match err {
        EvaluationError::Timeout(_) => FailureKind::Timeout,
        EvaluationError::Unavailable(_) => FailureKind::Unavailable,
        EvaluationError::Transient(_) => FailureKind::Transient,
        EvaluationError::Rejected(_) => FailureKind::Rejected,
        EvaluationError::InvalidResponse(_) => FailureKind::InvalidResponse,
    }
}
