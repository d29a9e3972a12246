//! Optimization run aggregate
//!
//! Owns the parameter space, combinations and every recorded outcome of one
//! run. Outcomes are write-once per (combination, phase). Once the run reaches
//! a terminal status nothing about it can change.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{OptimizerError, OptimizerResult};
use crate::expander::ParameterSpace;
use crate::types::{
    Combination, DateRange, Direction, EvaluationOutcome, Metric, MetricBundle, Phase, RunStatus,
};

/// Stable identifier: first 16 hex chars of a SHA-256 over the run inputs
pub fn run_id(
    strategy: &str,
    space: &ParameterSpace,
    window: DateRange,
    started_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy.as_bytes());
    hasher.update(b"|");
    hasher.update(space.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(window.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(started_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Inputs fixed at run creation
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub strategy: String,
    pub space: ParameterSpace,
    pub combinations: Vec<Combination>,
    pub target: Metric,
    pub direction: Direction,
    pub symbols: Vec<String>,
    pub window: DateRange,
    pub train_period: DateRange,
    pub test_period: Option<DateRange>,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct OptimizationRun {
    id: String,
    setup: RunSetup,
    train_outcomes: Vec<Option<EvaluationOutcome>>,
    test_outcomes: Vec<Option<EvaluationOutcome>>,
    /// Combination indices chosen for the test phase, best first
    selected: Vec<usize>,
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    low_confidence: bool,
    warnings: Vec<String>,
}

impl OptimizationRun {
    pub fn new(setup: RunSetup) -> Self {
        let started_at = Utc::now();
        let id = run_id(&setup.strategy, &setup.space, setup.window, started_at);
        let total = setup.combinations.len();

        OptimizationRun {
            id,
            setup,
            train_outcomes: vec![None; total],
            test_outcomes: vec![None; total],
            selected: Vec::new(),
            status: RunStatus::Pending,
            started_at,
            finished_at: None,
            failure_reason: None,
            low_confidence: false,
            warnings: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn strategy(&self) -> &str {
        &self.setup.strategy
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.setup.space
    }

    pub fn combinations(&self) -> &[Combination] {
        &self.setup.combinations
    }

    pub fn total_combinations(&self) -> usize {
        self.setup.combinations.len()
    }

    pub fn target(&self) -> Metric {
        self.setup.target
    }

    pub fn direction(&self) -> Direction {
        self.setup.direction
    }

    pub fn symbols(&self) -> &[String] {
        &self.setup.symbols
    }

    pub fn window(&self) -> DateRange {
        self.setup.window
    }

    pub fn train_period(&self) -> DateRange {
        self.setup.train_period
    }

    pub fn test_period(&self) -> Option<DateRange> {
        self.setup.test_period
    }

    pub fn workers(&self) -> usize {
        self.setup.workers
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Wall-clock time from creation to the terminal transition
    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn low_confidence(&self) -> bool {
        self.low_confidence
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    pub fn outcome(&self, phase: Phase, index: usize) -> Option<&EvaluationOutcome> {
        let outcomes = match phase {
            Phase::Train => &self.train_outcomes,
            Phase::Test => &self.test_outcomes,
        };
        outcomes.get(index).and_then(|o| o.as_ref())
    }

    pub fn train_metrics(&self, index: usize) -> Option<&MetricBundle> {
        self.outcome(Phase::Train, index).and_then(|o| o.metrics())
    }

    pub fn test_metrics(&self, index: usize) -> Option<&MetricBundle> {
        self.outcome(Phase::Test, index).and_then(|o| o.metrics())
    }

    /// Combinations with a successful train outcome, in index order
    pub fn successful_train(&self) -> impl Iterator<Item = (&Combination, &MetricBundle)> + '_ {
        self.setup
            .combinations
            .iter()
            .filter_map(|c| self.train_metrics(c.index).map(|m| (c, m)))
    }

    pub fn success_count(&self, phase: Phase) -> usize {
        self.count(phase, true)
    }

    pub fn failure_count(&self, phase: Phase) -> usize {
        self.count(phase, false)
    }

    fn count(&self, phase: Phase, success: bool) -> usize {
        let outcomes = match phase {
            Phase::Train => &self.train_outcomes,
            Phase::Test => &self.test_outcomes,
        };
        outcomes
            .iter()
            .flatten()
            .filter(|o| o.is_success() == success)
            .count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    // -------------------------------------------------------------------------
    // Mutation (only before the terminal transition)
    // -------------------------------------------------------------------------

    fn ensure_open(&self) -> OptimizerResult<()> {
        if self.status.is_terminal() {
            return Err(OptimizerError::RunSealed {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Record outcomes of a batch. `indices[i]` is the combination index that
    /// `outcomes[i]` belongs to. Slots already written are left untouched.
    pub fn record_outcomes(
        &mut self,
        phase: Phase,
        indices: &[usize],
        outcomes: Vec<Option<EvaluationOutcome>>,
    ) -> OptimizerResult<usize> {
        self.ensure_open()?;
        let slots = match phase {
            Phase::Train => &mut self.train_outcomes,
            Phase::Test => &mut self.test_outcomes,
        };

        let mut written = 0;
        for (&index, outcome) in indices.iter().zip(outcomes) {
            let Some(outcome) = outcome else { continue };
            match slots.get_mut(index) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(outcome);
                    written += 1;
                }
                Some(_) => {
                    warn!(combination = index, %phase, "Outcome already recorded, keeping the first");
                }
                None => {
                    warn!(combination = index, %phase, "Outcome for unknown combination ignored");
                }
            }
        }
        Ok(written)
    }

    pub fn set_selected(&mut self, selected: Vec<usize>) -> OptimizerResult<()> {
        self.ensure_open()?;
        self.selected = selected;
        Ok(())
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) -> OptimizerResult<()> {
        self.ensure_open()?;
        let warning = warning.into();
        warn!(run = %self.id, "{}", warning);
        self.warnings.push(warning);
        Ok(())
    }

    pub fn mark_low_confidence(&mut self, reason: impl Into<String>) -> OptimizerResult<()> {
        self.add_warning(reason)?;
        self.low_confidence = true;
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> OptimizerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OptimizerError::InvalidStatusTransition {
                from: self.status,
                to: next,
            });
        }
        info!(run = %self.id, "Run {} -> {}", self.status, next);
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> OptimizerResult<()> {
        self.transition(RunStatus::Running)
    }

    pub fn complete(&mut self) -> OptimizerResult<()> {
        self.transition(RunStatus::Completed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> OptimizerResult<()> {
        self.transition(RunStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> OptimizerResult<()> {
        self.transition(RunStatus::Cancelled)
    }
}
