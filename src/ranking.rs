//! Multi-criteria ranking
//!
//! Each successful train configuration gets five sub-scores, min-max
//! normalized across the run, and a weighted composite:
//!
//! | Sub-score          | Source metric                          | Weight |
//! |--------------------|----------------------------------------|--------|
//! | Sharpe             | `sharpe_ratio`                         | 0.40   |
//! | Consistency        | `win_rate`                             | 0.20   |
//! | Drawdown control   | `max_drawdown` (lower is better)       | 0.20   |
//! | Trade frequency    | `total_trades`                         | 0.10   |
//! | Capital efficiency | `calmar_ratio`, else return / drawdown | 0.10   |
//!
//! Scores are relative to the run, so they only compare within one run.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OptimizerError, OptimizerResult};
use crate::overfitting::{OverfittingAssessment, OverfittingDetector};
use crate::run::OptimizationRun;
use crate::types::{Combination, Metric, MetricBundle};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub sharpe: f64,
    pub consistency: f64,
    pub drawdown_control: f64,
    pub trade_frequency: f64,
    pub capital_efficiency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            sharpe: 0.40,
            consistency: 0.20,
            drawdown_control: 0.20,
            trade_frequency: 0.10,
            capital_efficiency: 0.10,
        }
    }
}

/// Minimums a configuration must meet to be ranked. `None` disables a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingFilters {
    pub min_trades: Option<f64>,
    pub min_win_rate: Option<f64>,
    pub min_sharpe: Option<f64>,
}

impl RankingFilters {
    fn accepts(&self, metrics: &MetricBundle) -> bool {
        let at_least = |min: Option<f64>, metric: Metric| {
            min.map_or(true, |min| metrics.value_or_zero(metric) >= min)
        };
        at_least(self.min_trades, Metric::TotalTrades)
            && at_least(self.min_win_rate, Metric::WinRate)
            && at_least(self.min_sharpe, Metric::SharpeRatio)
    }
}

/// Normalized [0, 1] components of the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub sharpe: f64,
    pub consistency: f64,
    pub drawdown_control: f64,
    pub trade_frequency: f64,
    pub capital_efficiency: f64,
}

impl SubScores {
    fn weighted(&self, w: &ScoreWeights) -> f64 {
        self.sharpe * w.sharpe
            + self.consistency * w.consistency
            + self.drawdown_control * w.drawdown_control
            + self.trade_frequency * w.trade_frequency
            + self.capital_efficiency * w.capital_efficiency
    }
}

/// Read-only leaderboard entry derived from a terminal run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    /// 1-based position on the leaderboard
    pub rank: usize,
    pub combination: Combination,
    pub composite_score: f64,
    pub sub_scores: SubScores,
    pub train_metrics: MetricBundle,
    pub test_metrics: Option<MetricBundle>,
    pub overfitting: Option<OverfittingAssessment>,
    pub low_confidence: bool,
}

impl RankedResult {
    pub fn trade_count(&self) -> f64 {
        self.train_metrics.value_or_zero(Metric::TotalTrades)
    }
}

/// Raw inputs before normalization
#[derive(Debug, Clone, Copy)]
struct RawScores {
    sharpe: f64,
    consistency: f64,
    drawdown: f64,
    trades: f64,
    efficiency: f64,
}

impl RawScores {
    fn from_bundle(m: &MetricBundle) -> Self {
        let drawdown = m.value_or_zero(Metric::MaxDrawdown);
        let efficiency = match m.get(Metric::CalmarRatio) {
            Some(calmar) => calmar,
            None if drawdown != 0.0 => m.value_or_zero(Metric::TotalReturn) / drawdown.abs(),
            None => m.value_or_zero(Metric::TotalReturn),
        };
        RawScores {
            sharpe: m.value_or_zero(Metric::SharpeRatio),
            consistency: m.value_or_zero(Metric::WinRate),
            drawdown,
            trades: m.value_or_zero(Metric::TotalTrades),
            efficiency,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Range {
    min: f64,
    max: f64,
}

impl Range {
    fn over(values: impl Iterator<Item = f64>) -> Self {
        values.fold(
            Range {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |r, v| Range {
                min: r.min.min(v),
                max: r.max.max(v),
            },
        )
    }

    /// Position of `v` in the range, 1.0 for everyone when the range is flat
    fn normalize(&self, v: f64) -> f64 {
        let span = self.max - self.min;
        if span.abs() < f64::EPSILON || !span.is_finite() {
            1.0
        } else {
            ((v - self.min) / span).clamp(0.0, 1.0)
        }
    }

    fn normalize_inverted(&self, v: f64) -> f64 {
        let span = self.max - self.min;
        if span.abs() < f64::EPSILON || !span.is_finite() {
            1.0
        } else {
            ((self.max - v) / span).clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub weights: ScoreWeights,
    pub filters: RankingFilters,
}

#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    config: RankingConfig,
    detector: OverfittingDetector,
}

impl RankingEngine {
    pub fn new(config: RankingConfig, detector: OverfittingDetector) -> Self {
        Self { config, detector }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    pub fn detector(&self) -> &OverfittingDetector {
        &self.detector
    }

    /// Full leaderboard. Failed combinations and those below the filters are
    /// excluded; the order is total: composite score, then trade count, then
    /// combination index.
    pub fn rank(&self, run: &OptimizationRun) -> OptimizerResult<Vec<RankedResult>> {
        if !run.is_terminal() {
            return Err(OptimizerError::RunNotTerminal(run.id().to_string()));
        }

        let candidates: Vec<(&Combination, &MetricBundle)> = run
            .successful_train()
            .filter(|(_, m)| self.config.filters.accepts(m))
            .collect();

        let successes = run.successful_train().count();
        if candidates.is_empty() {
            let reason = if successes == 0 {
                "every combination failed".to_string()
            } else {
                format!("none of {} successful combinations passed the filters", successes)
            };
            return Err(OptimizerError::EmptyResultSet(reason));
        }
        debug!(
            "Ranking {} of {} successful combinations",
            candidates.len(),
            successes
        );

        let raw: Vec<RawScores> = candidates
            .par_iter()
            .map(|(_, m)| RawScores::from_bundle(m))
            .collect();

        let sharpe = Range::over(raw.iter().map(|r| r.sharpe));
        let consistency = Range::over(raw.iter().map(|r| r.consistency));
        let drawdown = Range::over(raw.iter().map(|r| r.drawdown));
        let trades = Range::over(raw.iter().map(|r| r.trades));
        let efficiency = Range::over(raw.iter().map(|r| r.efficiency));

        let weights = self.config.weights;
        let target = run.target();
        let low_confidence = run.low_confidence();

        let mut ranked: Vec<RankedResult> = candidates
            .par_iter()
            .zip(raw.par_iter())
            .map(|((combo, train), r)| {
                let sub_scores = SubScores {
                    sharpe: sharpe.normalize(r.sharpe),
                    consistency: consistency.normalize(r.consistency),
                    drawdown_control: drawdown.normalize_inverted(r.drawdown),
                    trade_frequency: trades.normalize(r.trades),
                    capital_efficiency: efficiency.normalize(r.efficiency),
                };
                let test = run.test_metrics(combo.index);
                let overfitting = test.and_then(|test| {
                    match (train.get(target), test.get(target)) {
                        (Some(tr), Some(te)) => Some(self.detector.assess(tr, te, target)),
                        _ => None,
                    }
                });

                RankedResult {
                    rank: 0,
                    combination: (*combo).clone(),
                    composite_score: sub_scores.weighted(&weights),
                    sub_scores,
                    train_metrics: (*train).clone(),
                    test_metrics: test.cloned(),
                    overfitting,
                    low_confidence,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.composite_score
                .total_cmp(&a.composite_score)
                .then_with(|| b.trade_count().total_cmp(&a.trade_count()))
                .then_with(|| a.combination.index.cmp(&b.combination.index))
        });
        for (i, r) in ranked.iter_mut().enumerate() {
            r.rank = i + 1;
        }

        Ok(ranked)
    }

    /// First `top_n` entries of the leaderboard
    pub fn leaderboard(
        &self,
        run: &OptimizationRun,
        top_n: usize,
    ) -> OptimizerResult<Vec<RankedResult>> {
        let mut ranked = self.rank(run)?;
        ranked.truncate(top_n);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::ParameterSpace;
    use crate::run::RunSetup;
    use crate::types::{
        DateRange, Direction, EvaluationFailure, EvaluationOutcome, FailureKind, Phase,
    };
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn run_with(bundles: Vec<Option<MetricBundle>>) -> OptimizationRun {
        let values: Vec<String> = (0..bundles.len()).map(|i| i.to_string()).collect();
        let space = ParameterSpace::parse(&format!("n:{}", values.join(","))).unwrap();
        let combinations = space.expand(1000).unwrap();
        let window = DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .unwrap();
        let mut run = OptimizationRun::new(RunSetup {
            strategy: "s".to_string(),
            space,
            combinations,
            target: Metric::SharpeRatio,
            direction: Direction::Maximize,
            symbols: vec![],
            window,
            train_period: window,
            test_period: None,
            workers: 1,
        });
        run.start().unwrap();
        let indices: Vec<usize> = (0..bundles.len()).collect();
        let outcomes = bundles
            .into_iter()
            .map(|b| {
                Some(match b {
                    Some(m) => EvaluationOutcome::Success(m),
                    None => EvaluationOutcome::Failure(EvaluationFailure {
                        kind: FailureKind::Rejected,
                        message: "forced".to_string(),
                        attempts: 1,
                    }),
                })
            })
            .collect();
        run.record_outcomes(Phase::Train, &indices, outcomes).unwrap();
        run.complete().unwrap();
        run
    }

    fn bundle(sharpe: f64, win: f64, dd: f64, trades: f64, ret: f64) -> MetricBundle {
        MetricBundle::from_iter([
            (Metric::SharpeRatio, sharpe),
            (Metric::WinRate, win),
            (Metric::MaxDrawdown, dd),
            (Metric::TotalTrades, trades),
            (Metric::TotalReturn, ret),
        ])
    }

    #[test]
    fn test_dominant_configuration_scores_one() {
        let run = run_with(vec![
            Some(bundle(0.5, 40.0, 30.0, 10.0, 5.0)),
            Some(bundle(2.0, 60.0, 10.0, 50.0, 40.0)),
            Some(bundle(1.0, 50.0, 20.0, 30.0, 20.0)),
        ]);
        let ranked = RankingEngine::default().rank(&run).unwrap();

        assert_eq!(ranked[0].combination.index, 1);
        assert_relative_eq!(ranked[0].composite_score, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ranked[2].composite_score, 0.0, epsilon = 1e-12);
        assert_eq!(
            ranked.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_failures_are_excluded() {
        let run = run_with(vec![None, Some(bundle(1.0, 50.0, 10.0, 20.0, 5.0)), None]);
        let ranked = RankingEngine::default().rank(&run).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].combination.index, 1);
        // Flat ranges normalize to 1.0
        assert_relative_eq!(ranked[0].composite_score, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ties_break_on_trades_then_index() {
        let same = bundle(1.0, 50.0, 10.0, 20.0, 5.0);
        let more_trades = MetricBundle::from_iter(
            same.iter()
                .map(|(m, v)| if m == Metric::TotalTrades { (m, 25.0) } else { (m, v) }),
        );
        // Trade frequency carries no weight, so all three composites are equal
        let config = RankingConfig {
            weights: ScoreWeights {
                trade_frequency: 0.0,
                ..ScoreWeights::default()
            },
            ..RankingConfig::default()
        };
        let run = run_with(vec![Some(same.clone()), Some(more_trades), Some(same)]);
        let ranked = RankingEngine::new(config, OverfittingDetector::default())
            .rank(&run)
            .unwrap();
        let order: Vec<usize> = ranked.iter().map(|r| r.combination.index).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_filters() {
        let run = run_with(vec![
            Some(bundle(1.5, 55.0, 10.0, 5.0, 10.0)),
            Some(bundle(0.2, 35.0, 10.0, 40.0, 10.0)),
            Some(bundle(1.0, 50.0, 10.0, 40.0, 10.0)),
        ]);
        let config = RankingConfig {
            filters: RankingFilters {
                min_trades: Some(10.0),
                min_win_rate: Some(40.0),
                min_sharpe: None,
            },
            ..RankingConfig::default()
        };
        let ranked = RankingEngine::new(config, OverfittingDetector::default())
            .rank(&run)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].combination.index, 2);
    }

    #[test]
    fn test_empty_result_set() {
        let all_failed = run_with(vec![None, None]);
        assert!(matches!(
            RankingEngine::default().rank(&all_failed),
            Err(OptimizerError::EmptyResultSet(_))
        ));

        let filtered = run_with(vec![Some(bundle(0.1, 10.0, 50.0, 1.0, -5.0))]);
        let config = RankingConfig {
            filters: RankingFilters {
                min_sharpe: Some(1.0),
                ..RankingFilters::default()
            },
            ..RankingConfig::default()
        };
        let err = RankingEngine::new(config, OverfittingDetector::default())
            .rank(&filtered)
            .unwrap_err();
        assert!(err.to_string().contains("filters"));
    }

    #[test]
    fn test_capital_efficiency_prefers_calmar() {
        let with_calmar = MetricBundle::from_iter([
            (Metric::CalmarRatio, 3.0),
            (Metric::TotalReturn, 10.0),
            (Metric::MaxDrawdown, 5.0),
        ]);
        assert_relative_eq!(RawScores::from_bundle(&with_calmar).efficiency, 3.0);

        let derived = bundle(1.0, 50.0, 5.0, 10.0, 10.0);
        assert_relative_eq!(RawScores::from_bundle(&derived).efficiency, 2.0);

        let no_drawdown = bundle(1.0, 50.0, 0.0, 10.0, 10.0);
        assert_relative_eq!(RawScores::from_bundle(&no_drawdown).efficiency, 10.0);
    }

    #[test]
    fn test_reranking_is_identical() {
        let run = run_with(vec![
            Some(bundle(0.7, 45.0, 12.0, 18.0, 8.0)),
            Some(bundle(1.3, 52.0, 22.0, 31.0, 14.0)),
            Some(bundle(1.1, 61.0, 9.0, 12.0, 11.0)),
        ]);
        let engine = RankingEngine::default();
        let first = serde_json::to_string(&engine.rank(&run).unwrap()).unwrap();
        let second = serde_json::to_string(&engine.rank(&run).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
