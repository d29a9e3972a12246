//! Core data types shared by every stage of an optimization run

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::OptimizerError;

// =============================================================================
// Parameters
// =============================================================================

/// A single candidate value, typed at parse time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl ParamValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(_) | ParamValue::Text(_) => None,
        }
    }
}

/// One named value inside a combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamAssignment {
    pub name: String,
    pub value: ParamValue,
}

/// One concrete assignment of a value to every parameter.
///
/// `index` is the position in the canonical enumeration order and identifies
/// the combination for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combination {
    pub index: usize,
    pub values: Vec<ParamAssignment>,
}

impl Combination {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// Parameters as a JSON object, in declaration order
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|a| {
                let value = serde_json::to_value(&a.value).unwrap_or(serde_json::Value::Null);
                (a.name.clone(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|a| format!("{}={}", a.name, a.value))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Known performance metrics returned by the evaluation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    SharpeRatio,
    SortinoRatio,
    TotalReturn,
    MaxDrawdown,
    WinRate,
    TotalTrades,
    ProfitFactor,
    CalmarRatio,
    Expectancy,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::SharpeRatio,
        Metric::SortinoRatio,
        Metric::TotalReturn,
        Metric::MaxDrawdown,
        Metric::WinRate,
        Metric::TotalTrades,
        Metric::ProfitFactor,
        Metric::CalmarRatio,
        Metric::Expectancy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::SharpeRatio => "sharpe_ratio",
            Metric::SortinoRatio => "sortino_ratio",
            Metric::TotalReturn => "total_return",
            Metric::MaxDrawdown => "max_drawdown",
            Metric::WinRate => "win_rate",
            Metric::TotalTrades => "total_trades",
            Metric::ProfitFactor => "profit_factor",
            Metric::CalmarRatio => "calmar_ratio",
            Metric::Expectancy => "expectancy",
        }
    }

    /// Drawdown is a positive magnitude, so smaller is better
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Metric::MaxDrawdown)
    }

    /// Natural optimization direction for this metric
    pub fn natural_direction(&self) -> Direction {
        if self.higher_is_better() {
            Direction::Maximize
        } else {
            Direction::Minimize
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let metric = match s.trim().to_ascii_lowercase().as_str() {
            "sharpe_ratio" | "sharpe" => Metric::SharpeRatio,
            "sortino_ratio" | "sortino" => Metric::SortinoRatio,
            "total_return" | "return" => Metric::TotalReturn,
            "max_drawdown" | "drawdown" => Metric::MaxDrawdown,
            "win_rate" => Metric::WinRate,
            "total_trades" | "trades" => Metric::TotalTrades,
            "profit_factor" => Metric::ProfitFactor,
            "calmar_ratio" | "calmar" => Metric::CalmarRatio,
            "expectancy" => Metric::Expectancy,
            _ => return Err(OptimizerError::UnknownMetric(s.to_string())),
        };
        Ok(metric)
    }
}

/// Metric values for one (combination, period) pair. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBundle(BTreeMap<Metric, f64>);

impl MetricBundle {
    pub fn new(values: BTreeMap<Metric, f64>) -> Self {
        MetricBundle(values)
    }

    /// Build from raw service output, rejecting names outside the catalogue
    pub fn from_raw<I, K>(raw: I) -> Result<Self, OptimizerError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for (name, value) in raw {
            let metric: Metric = name.as_ref().parse()?;
            values.insert(metric, value);
        }
        Ok(MetricBundle(values))
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0.get(&metric).copied()
    }

    /// Value or zero when the service did not report the metric
    pub fn value_or_zero(&self, metric: Metric) -> f64 {
        self.get(metric).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.0.iter().map(|(m, v)| (*m, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Metric, f64)> for MetricBundle {
    fn from_iter<T: IntoIterator<Item = (Metric, f64)>>(iter: T) -> Self {
        MetricBundle(iter.into_iter().collect())
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why an evaluation ended without metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    Transient,
    Rejected,
    InvalidResponse,
    CircuitOpen,
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Transient => "transient",
            FailureKind::Rejected => "rejected",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.kind, self.attempts, self.message
        )
    }
}

/// Result of evaluating one combination over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Success(MetricBundle),
    Failure(EvaluationFailure),
}

impl EvaluationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EvaluationOutcome::Success(_))
    }

    pub fn metrics(&self) -> Option<&MetricBundle> {
        match self {
            EvaluationOutcome::Success(bundle) => Some(bundle),
            EvaluationOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&EvaluationFailure> {
        match self {
            EvaluationOutcome::Success(_) => None,
            EvaluationOutcome::Failure(failure) => Some(failure),
        }
    }
}

// =============================================================================
// Periods, direction, lifecycle
// =============================================================================

/// Half-open calendar window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, OptimizerError> {
        if end <= start {
            return Err(OptimizerError::InvalidSplit(format!(
                "window end {} must be after start {}",
                end, start
            )));
        }
        Ok(DateRange { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Optimization direction for the target metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    /// Compare two values so that the better one orders first
    pub fn compare(&self, a: f64, b: f64) -> std::cmp::Ordering {
        match self {
            Direction::Maximize => b.total_cmp(&a),
            Direction::Minimize => a.total_cmp(&b),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Maximize => f.write_str("maximize"),
            Direction::Minimize => f.write_str("minimize"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maximize" | "max" => Ok(Direction::Maximize),
            "minimize" | "min" => Ok(Direction::Minimize),
            other => Err(format!(
                "unknown direction '{}', expected maximize or minimize",
                other
            )),
        }
    }
}

/// Which window an evaluation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => f.write_str("train"),
            Phase::Test => f.write_str("test"),
        }
    }
}

/// Lifecycle of an optimization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// `pending -> running -> terminal`, a pending run may also fail or be cancelled
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed | RunStatus::Cancelled) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_aliases() {
        assert_eq!("sharpe".parse::<Metric>().unwrap(), Metric::SharpeRatio);
        assert_eq!("Sharpe_Ratio".parse::<Metric>().unwrap(), Metric::SharpeRatio);
        assert_eq!("drawdown".parse::<Metric>().unwrap(), Metric::MaxDrawdown);
        assert!("alpha".parse::<Metric>().is_err());
    }

    #[test]
    fn test_only_drawdown_is_lower_better() {
        for metric in Metric::ALL {
            assert_eq!(metric.higher_is_better(), metric != Metric::MaxDrawdown);
        }
    }

    #[test]
    fn test_bundle_rejects_unknown_metric() {
        let ok = MetricBundle::from_raw(vec![("sharpe_ratio", 1.2), ("total_trades", 40.0)]);
        assert_eq!(ok.unwrap().get(Metric::SharpeRatio), Some(1.2));

        let err = MetricBundle::from_raw(vec![("sharpe_ratio", 1.2), ("vibes", 9.0)]);
        assert!(matches!(err, Err(OptimizerError::UnknownMetric(name)) if name == "vibes"));
    }

    #[test]
    fn test_bundle_serializes_with_metric_names() {
        let bundle: MetricBundle = vec![(Metric::WinRate, 55.0)].into_iter().collect();
        let json = serde_json::to_string(&bundle).unwrap();
        assert_eq!(json, r#"{"win_rate":55.0}"#);
        let back: MetricBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn test_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_direction_compare_orders_best_first() {
        let mut values = vec![1.0, 3.0, 2.0];
        values.sort_by(|a, b| Direction::Maximize.compare(*a, *b));
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
        values.sort_by(|a, b| Direction::Minimize.compare(*a, *b));
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_date_range_rejects_empty_window() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(DateRange::new(d, d).is_err());
        let r = DateRange::new(d, NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()).unwrap();
        assert_eq!(r.days(), 10);
    }
}
