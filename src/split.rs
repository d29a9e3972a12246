//! Train/test split and the two-phase optimization protocol
//!
//! Phase one searches the whole parameter space on the train window. Phase two
//! re-evaluates only the best train configurations on the held-out test window.
//! Without a split ratio the run is single-phase over the full window.

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use crate::coordinator::ExecutionCoordinator;
use crate::error::{OptimizerError, OptimizerResult};
use crate::evaluation::Evaluator;
use crate::expander::{expand_spec, DEFAULT_MAX_COMBINATIONS};
use crate::run::{OptimizationRun, RunSetup};
use crate::types::{Combination, DateRange, Direction, Metric, Phase};

pub const DEFAULT_RETEST_TOP: usize = 5;
pub const DEFAULT_MIN_TEST_DAYS: i64 = 30;

/// Partition `window` into consecutive train and test windows.
///
/// The train window takes `round(ratio * days)` days. Both windows must keep
/// at least one day. `train.end == test.start`, so together they cover the
/// full window with no gap and no overlap.
pub fn split_window(window: DateRange, ratio: f64) -> OptimizerResult<(DateRange, DateRange)> {
    if !ratio.is_finite() || ratio <= 0.0 || ratio >= 1.0 {
        return Err(OptimizerError::InvalidSplit(format!(
            "ratio {} is outside (0, 1)",
            ratio
        )));
    }

    let total_days = window.days();
    let train_days = (ratio * total_days as f64).round() as i64;
    if train_days < 1 || train_days >= total_days {
        return Err(OptimizerError::InvalidSplit(format!(
            "ratio {} over {} days leaves an empty train or test window",
            ratio, total_days
        )));
    }

    let boundary = window.start + ChronoDuration::days(train_days);
    let train = DateRange::new(window.start, boundary)?;
    let test = DateRange::new(boundary, window.end)?;
    Ok((train, test))
}

/// Best `k` successful train configurations by the target metric.
/// Ties go to the lower combination index. Bundles missing the target are skipped.
pub fn select_top(run: &OptimizationRun, k: usize) -> Vec<usize> {
    let target = run.target();
    let direction = run.direction();

    let mut candidates: Vec<(usize, f64)> = run
        .successful_train()
        .filter_map(|(combo, metrics)| metrics.get(target).map(|v| (combo.index, v)))
        .collect();

    candidates.sort_by(|a, b| direction.compare(a.1, b.1).then(a.0.cmp(&b.0)));
    candidates.into_iter().take(k).map(|(index, _)| index).collect()
}

/// Everything needed to start one optimization run
#[derive(Debug, Clone)]
pub struct OptimizationRequest {
    pub strategy: String,
    /// `name:v1,v2;name2:v1` parameter specification
    pub spec: String,
    pub target: Metric,
    pub direction: Direction,
    pub window: DateRange,
    pub symbols: Vec<String>,
    /// `None` runs a single phase over the full window
    pub split_ratio: Option<f64>,
    pub retest_top: usize,
    pub max_combinations: usize,
    pub min_test_days: i64,
}

impl OptimizationRequest {
    /// Request with the target's natural direction and default limits
    pub fn new(
        strategy: impl Into<String>,
        spec: impl Into<String>,
        target: Metric,
        window: DateRange,
    ) -> Self {
        OptimizationRequest {
            strategy: strategy.into(),
            spec: spec.into(),
            target,
            direction: target.natural_direction(),
            window,
            symbols: Vec::new(),
            split_ratio: None,
            retest_top: DEFAULT_RETEST_TOP,
            max_combinations: DEFAULT_MAX_COMBINATIONS,
            min_test_days: DEFAULT_MIN_TEST_DAYS,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_split_ratio(mut self, ratio: Option<f64>) -> Self {
        self.split_ratio = ratio;
        self
    }

    pub fn with_retest_top(mut self, top: usize) -> Self {
        self.retest_top = top.max(1);
        self
    }

    pub fn with_max_combinations(mut self, ceiling: usize) -> Self {
        self.max_combinations = ceiling;
        self
    }

    pub fn with_min_test_days(mut self, days: i64) -> Self {
        self.min_test_days = days;
        self
    }
}

/// Drives a run from specification to terminal status
pub struct SplitController<E> {
    coordinator: ExecutionCoordinator<E>,
}

impl<E: Evaluator> SplitController<E> {
    pub fn new(coordinator: ExecutionCoordinator<E>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator<E> {
        &self.coordinator
    }

    /// Run both phases.
    ///
    /// Specification and ceiling errors are returned before any evaluation.
    /// Everything after that ends in a terminal run, even if every
    /// combination failed.
    pub async fn run(&self, request: &OptimizationRequest) -> OptimizerResult<OptimizationRun> {
        let (space, combinations) = expand_spec(&request.spec, request.max_combinations)?;

        let (train_period, test_period) = match request.split_ratio {
            Some(ratio) => {
                let (train, test) = split_window(request.window, ratio)?;
                (train, Some(test))
            }
            None => (request.window, None),
        };

        let mut run = OptimizationRun::new(RunSetup {
            strategy: request.strategy.clone(),
            space,
            combinations,
            target: request.target,
            direction: request.direction,
            symbols: request.symbols.clone(),
            window: request.window,
            train_period,
            test_period,
            workers: self.coordinator.workers(),
        });

        info!(
            run = run.id(),
            "Optimizing {} over {} combinations, target {} ({})",
            run.strategy(),
            run.total_combinations(),
            run.target(),
            run.direction()
        );
        match test_period {
            Some(test) => info!("Train window {}, test window {}", train_period, test),
            None => info!("Single-phase run over {}", train_period),
        }

        if let Some(test) = test_period {
            if test.days() < request.min_test_days {
                run.mark_low_confidence(format!(
                    "test window has {} days, fewer than the {} needed for stable metrics",
                    test.days(),
                    request.min_test_days
                ))?;
            }
        }

        if let Err(e) = self.coordinator.client().check_service().await {
            warn!("Evaluation service precondition failed: {}", e);
            run.fail(format!("evaluation service unreachable: {}", e))?;
            return Ok(run);
        }

        run.start()?;

        // Phase one: full search on the train window
        let train = self
            .coordinator
            .execute(
                run.strategy(),
                run.combinations(),
                train_period,
                run.symbols(),
                Phase::Train,
            )
            .await;
        let indices: Vec<usize> = run.combinations().iter().map(|c| c.index).collect();
        run.record_outcomes(Phase::Train, &indices, train.outcomes)?;

        if train.cancelled {
            run.cancel()?;
            return Ok(run);
        }

        if run.success_count(Phase::Train) == 0 {
            run.add_warning(
                OptimizerError::EmptyResultSet("every combination failed in the train phase".into())
                    .to_string(),
            )?;
            run.complete()?;
            return Ok(run);
        }

        // Phase two: re-evaluate the best train configurations out of sample
        if let Some(test) = test_period {
            let selected = select_top(&run, request.retest_top);
            info!(
                "Re-testing {} configurations on {}: {:?}",
                selected.len(),
                test,
                selected
            );
            let retest: Vec<Combination> = selected
                .iter()
                .map(|&i| run.combinations()[i].clone())
                .collect();
            run.set_selected(selected.clone())?;

            let outcome = self
                .coordinator
                .execute(run.strategy(), &retest, test, run.symbols(), Phase::Test)
                .await;
            run.record_outcomes(Phase::Test, &selected, outcome.outcomes)?;

            if outcome.cancelled {
                run.cancel()?;
                return Ok(run);
            }
        }

        run.complete()?;
        info!(
            run = run.id(),
            "Run completed: {} ok / {} failed (train), {} ok / {} failed (test)",
            run.success_count(Phase::Train),
            run.failure_count(Phase::Train),
            run.success_count(Phase::Test),
            run.failure_count(Phase::Test)
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::evaluation::{EvaluationClient, EvaluationRequest, FnEvaluator};
    use crate::types::{MetricBundle, ParamValue, RunStatus};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn window(days: i64) -> DateRange {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        DateRange::new(start, start + ChronoDuration::days(days)).unwrap()
    }

    #[test]
    fn test_split_is_contiguous_and_exhaustive() {
        let full = window(365);
        for ratio in [0.1, 0.25, 0.5, 0.7, 0.8, 0.95] {
            let (train, test) = split_window(full, ratio).unwrap();
            assert_eq!(train.start, full.start);
            assert_eq!(train.end, test.start);
            assert_eq!(test.end, full.end);
            assert_eq!(train.days() + test.days(), full.days());
        }
    }

    #[test]
    fn test_train_length_rounds() {
        let (train, test) = split_window(window(10), 0.75).unwrap();
        assert_eq!(train.days(), 8);
        assert_eq!(test.days(), 2);
    }

    #[test]
    fn test_invalid_ratios() {
        for ratio in [0.0, 1.0, -0.2, 1.5, f64::NAN] {
            assert!(matches!(
                split_window(window(100), ratio),
                Err(OptimizerError::InvalidSplit(_))
            ));
        }
        // One day cannot be shared
        assert!(split_window(window(1), 0.5).is_err());
        // 0.99 of 10 days rounds to 10, leaving no test window
        assert!(split_window(window(10), 0.99).is_err());
    }

    fn sharpe_is_period_over_20() -> FnEvaluator<
        impl Fn(&EvaluationRequest) -> Result<MetricBundle, EvaluationError> + Send + Sync + 'static,
    > {
        FnEvaluator::new(|req: &EvaluationRequest| {
            let period = req
                .combination
                .get("period")
                .and_then(ParamValue::as_f64)
                .unwrap_or(0.0);
            Ok(MetricBundle::from_iter([
                (Metric::SharpeRatio, period / 20.0),
                (Metric::TotalTrades, 10.0),
            ]))
        })
    }

    fn controller() -> SplitController<impl Evaluator> {
        let client = Arc::new(EvaluationClient::with_defaults(sharpe_is_period_over_20()));
        SplitController::new(ExecutionCoordinator::new(client, 4))
    }

    #[tokio::test]
    async fn test_single_phase_has_no_test_outcomes() {
        let request = OptimizationRequest::new("s", "period:10,20,50", Metric::SharpeRatio, window(365));
        let run = controller().run(&request).await.unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.test_period().is_none());
        assert_eq!(run.success_count(Phase::Train), 3);
        assert_eq!(run.success_count(Phase::Test), 0);
        assert!(run.selected().is_empty());
    }

    #[tokio::test]
    async fn test_two_phase_retests_top_k_only() {
        let request = OptimizationRequest::new(
            "s",
            "period:10,20,30,40,50",
            Metric::SharpeRatio,
            window(365),
        )
        .with_split_ratio(Some(0.7))
        .with_retest_top(2);
        let run = controller().run(&request).await.unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.selected(), &[4, 3]);
        assert_eq!(run.success_count(Phase::Test), 2);
        assert!(run.test_metrics(4).is_some());
        assert!(run.test_metrics(0).is_none());
        assert!(!run.low_confidence());
    }

    #[tokio::test]
    async fn test_short_test_window_is_low_confidence() {
        let request = OptimizationRequest::new("s", "period:10,20", Metric::SharpeRatio, window(60))
            .with_split_ratio(Some(0.8));
        let run = controller().run(&request).await.unwrap();

        assert_eq!(run.test_period().unwrap().days(), 12);
        assert!(run.low_confidence());
        assert_eq!(run.warnings().len(), 1);
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_select_top_minimize_and_ties() {
        let request = OptimizationRequest::new("s", "period:10,20,20,50", Metric::SharpeRatio, window(365))
            .with_direction(Direction::Minimize);
        let run = controller().run(&request).await.unwrap();
        // Sharpe 0.5, 1.0, 1.0, 2.5: lowest first, tie broken by index
        assert_eq!(select_top(&run, 3), vec![0, 1, 2]);
        assert_eq!(select_top(&run, 10).len(), 4);
    }

    #[tokio::test]
    async fn test_spec_errors_surface_before_work() {
        let bad = OptimizationRequest::new("s", "period:", Metric::SharpeRatio, window(365));
        assert!(matches!(
            controller().run(&bad).await,
            Err(OptimizerError::ParameterParse(_))
        ));

        let huge = OptimizationRequest::new("s", "a:1,2,3;b:1,2,3", Metric::SharpeRatio, window(365))
            .with_max_combinations(5);
        assert!(matches!(
            controller().run(&huge).await,
            Err(OptimizerError::CombinationExplosion { .. })
        ));
    }
}
