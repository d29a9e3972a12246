//! Evaluation service integration
//!
//! The evaluation service turns (strategy, parameters, period, symbols) into a
//! metric bundle. This module defines the seam (`Evaluator`), the in-process and
//! HTTP implementations, and the `EvaluationClient` adapter that applies the
//! timeout, retry and circuit breaker policy around any evaluator.

pub mod circuit_breaker;
pub mod client;
pub mod http;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{EvaluationClient, RetryPolicy};
pub use http::HttpEvaluator;

use serde::Serialize;
use std::future::Future;

use crate::error::EvaluationError;
use crate::types::{Combination, DateRange, MetricBundle};

/// Everything the service needs to score one combination over one window
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub strategy: String,
    pub combination: Combination,
    pub period: DateRange,
    pub symbols: Vec<String>,
}

/// External evaluation service.
///
/// Implementations must tolerate many concurrent calls for the same strategy
/// with different combinations.
pub trait Evaluator: Send + Sync + 'static {
    fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> impl Future<Output = Result<MetricBundle, EvaluationError>> + Send;

    /// Run-level precondition checked before any job is dispatched
    fn health_check(&self) -> impl Future<Output = Result<(), EvaluationError>> + Send {
        async { Ok(()) }
    }
}

/// Evaluator backed by a synchronous closure
pub struct FnEvaluator<F> {
    func: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&EvaluationRequest) -> Result<MetricBundle, EvaluationError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        FnEvaluator { func }
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&EvaluationRequest) -> Result<MetricBundle, EvaluationError> + Send + Sync + 'static,
{
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<MetricBundle, EvaluationError> {
        (self.func)(request)
    }
}
