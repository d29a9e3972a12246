//! HTTP evaluator for a remote backtest service
//!
//! Protocol:
//! - `POST {base}/evaluate` with `{strategy, params, start, end, symbols}`
//! - `200` with `{"metrics": {"sharpe_ratio": 1.2, ...}}` on success
//! - `{"error": "..."}` (any status) when the service refuses the request
//! - `GET {base}/health` for the run-level reachability check

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{EvaluationRequest, Evaluator};
use crate::error::EvaluationError;
use crate::types::MetricBundle;

#[derive(Debug, Serialize)]
struct EvaluatePayload<'a> {
    strategy: &'a str,
    params: serde_json::Value,
    start: String,
    end: String,
    symbols: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    metrics: Option<HashMap<String, f64>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpEvaluator {
    client: Client,
    base_url: String,
}

impl HttpEvaluator {
    /// `timeout` bounds the HTTP exchange itself; the adapter applies its own
    /// per-call timeout on top
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EvaluationError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| EvaluationError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpEvaluator {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<MetricBundle, EvaluationError> {
        let url = format!("{}/evaluate", self.base_url);
        let payload = EvaluatePayload {
            strategy: &request.strategy,
            params: request.combination.to_json(),
            start: request.period.start.to_string(),
            end: request.period.end.to_string(),
            symbols: &request.symbols,
        };

        debug!(
            combination = request.combination.index,
            period = %request.period,
            "POST {}",
            url
        );

        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if is_transient_status(status) {
            return Err(EvaluationError::Transient(format!("HTTP {}: {}", status, body)));
        }

        let parsed: EvaluateResponse = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                EvaluationError::InvalidResponse(format!("{} (body: {})", e, body))
            } else {
                EvaluationError::Rejected(format!("HTTP {}: {}", status, body))
            }
        })?;

        if let Some(reason) = parsed.error {
            return Err(EvaluationError::Rejected(reason));
        }
        if !status.is_success() {
            return Err(EvaluationError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        let metrics = parsed.metrics.ok_or_else(|| {
            EvaluationError::InvalidResponse("response carries neither metrics nor error".to_string())
        })?;

        MetricBundle::from_raw(metrics).map_err(|e| EvaluationError::InvalidResponse(e.to_string()))
    }

    async fn health_check(&self) -> Result<(), EvaluationError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EvaluationError::Unavailable(format!(
                "health check returned HTTP {}",
                response.status()
            )))
        }
    }
}

/// Throttling, request timeouts and server errors are worth retrying
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::OK));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let eval = HttpEvaluator::new("http://localhost:8000/", Duration::from_secs(5)).unwrap();
        assert_eq!(eval.base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_response_parsing() {
        let ok: EvaluateResponse =
            serde_json::from_str(r#"{"metrics": {"sharpe_ratio": 1.1, "total_trades": 12}}"#).unwrap();
        assert_eq!(ok.metrics.unwrap().len(), 2);

        let refused: EvaluateResponse = serde_json::from_str(r#"{"error": "unknown strategy"}"#).unwrap();
        assert_eq!(refused.error.as_deref(), Some("unknown strategy"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Port 9 (discard) on localhost is not expected to host an HTTP service
        let eval = HttpEvaluator::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = eval.health_check().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {:?}", err);
    }
}
