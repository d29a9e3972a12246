//! Circuit breaker guarding the evaluation service
//!
//! After enough consecutive failed evaluations the breaker opens and further
//! calls fail fast instead of piling onto a service that is down. Once the
//! cooldown has elapsed a bounded number of probes is let through (half-open);
//! enough successful probes close it again.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes. Also the
    /// number of probes allowed in flight while half-open.
    pub success_threshold: u32,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    probes_in_flight: u32,
    config: CircuitBreakerConfig,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_successes: 0,
            probes_in_flight: 0,
            config,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn probes_in_flight(&self) -> u32 {
        self.probes_in_flight
    }

    /// Whether a call may go through right now. Moves Open to HalfOpen once
    /// the cooldown has elapsed. While half-open at most `success_threshold`
    /// probes are in flight; every admitted probe must be settled with
    /// `record_success`, `record_failure` or `record_retry`.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.admit_probe(),
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return false;
                }
                tracing::info!("Evaluation circuit half-open, probing service");
                self.state = CircuitState::HalfOpen;
                self.probe_successes = 0;
                self.probes_in_flight = 0;
                self.admit_probe()
            }
        }
    }

    fn admit_probe(&mut self) -> bool {
        if self.probes_in_flight >= self.config.success_threshold {
            return false;
        }
        self.probes_in_flight += 1;
        true
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                self.probe_successes += 1;
                if self.probe_successes >= self.config.success_threshold {
                    tracing::info!("Evaluation circuit closed, service recovered");
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.probe_successes = 0;
                    self.probes_in_flight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "Evaluation circuit opened"
                    );
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Evaluation probe failed, circuit re-opened");
                self.open();
            }
            CircuitState::Open => self.opened_at = Some(Instant::now()),
        }
    }

    /// A transient failure that will be retried. Outside half-open it does
    /// not count towards the streak; a half-open probe that needs a retry
    /// re-opens the circuit.
    pub fn record_retry(&mut self) {
        if self.state == CircuitState::HalfOpen {
            tracing::warn!("Evaluation probe needs a retry, circuit re-opened");
            self.open();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_successes = 0;
        self.probes_in_flight = 0;
    }
}
