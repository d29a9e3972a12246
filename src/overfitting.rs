//! Overfitting detection
//!
//! Compares how a configuration did on the test window against the train
//! window for the target metric. The ratio always reads "how much of the train
//! performance held up": above 1.0 the test window was at least as favorable,
//! below the threshold the configuration most likely fit noise.

use serde::{Deserialize, Serialize};
use std::fmt;

use tracing::warn;

use crate::types::Metric;

/// Default boundary between `HighOverfitting` and `Moderate`
pub const DEFAULT_OVERFITTING_THRESHOLD: f64 = 0.7;

/// Lower bound of the `Good` band
const GOOD_BAND_FLOOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverfittingClass {
    HighOverfitting,
    Moderate,
    Good,
    Excellent,
    /// Train value was zero, no ratio can be formed
    Undefined,
}

impl OverfittingClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverfittingClass::HighOverfitting => "high_overfitting",
            OverfittingClass::Moderate => "moderate",
            OverfittingClass::Good => "good",
            OverfittingClass::Excellent => "excellent",
            OverfittingClass::Undefined => "undefined",
        }
    }
}

impl fmt::Display for OverfittingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of comparing one configuration's train and test values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverfittingAssessment {
    pub metric: Metric,
    pub train_value: f64,
    pub test_value: f64,
    /// `None` when the train value is zero
    pub ratio: Option<f64>,
    pub classification: OverfittingClass,
    /// Train was favorable (positive) and test unfavorable (negative)
    pub sign_reversal: bool,
}

impl OverfittingAssessment {
    pub fn is_overfit(&self) -> bool {
        self.classification == OverfittingClass::HighOverfitting || self.sign_reversal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OverfittingDetector {
    threshold: f64,
}

impl Default for OverfittingDetector {
    fn default() -> Self {
        Self::new(DEFAULT_OVERFITTING_THRESHOLD)
    }
}

impl OverfittingDetector {
    /// The threshold is clamped to `[0, 0.8]` so the bands stay ordered. A
    /// clamped or non-finite value is logged with the threshold actually used.
    pub fn new(threshold: f64) -> Self {
        let effective = if threshold.is_finite() {
            threshold.clamp(0.0, GOOD_BAND_FLOOR)
        } else {
            DEFAULT_OVERFITTING_THRESHOLD
        };
        if effective != threshold {
            warn!(
                requested = threshold,
                effective, "Overfitting threshold outside [0, {}], using {}", GOOD_BAND_FLOOR, effective
            );
        }
        Self {
            threshold: effective,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Ratio of test to train performance, oriented so that higher means the
    /// configuration held up better. `None` when train is zero, or when a
    /// lower-is-better test value is zero.
    ///
    /// Higher-is-better: `test / train`. Lower-is-better magnitudes such as
    /// drawdown: `train / test`. A negative train value falls back to
    /// `1 + change / |train|`, which stays monotonic in test.
    pub fn ratio(train: f64, test: f64, metric: Metric) -> Option<f64> {
        if train == 0.0 || !train.is_finite() || !test.is_finite() {
            return None;
        }
        if metric.higher_is_better() {
            if train > 0.0 {
                Some(test / train)
            } else {
                Some(1.0 + (test - train) / train.abs())
            }
        } else if train > 0.0 && test > 0.0 {
            Some(train / test)
        } else if train > 0.0 && test == 0.0 {
            None
        } else {
            Some(1.0 + (train - test) / train.abs())
        }
    }

    pub fn classify(&self, ratio: f64) -> OverfittingClass {
        if ratio < self.threshold {
            OverfittingClass::HighOverfitting
        } else if ratio < GOOD_BAND_FLOOR {
            OverfittingClass::Moderate
        } else if ratio <= 1.0 {
            OverfittingClass::Good
        } else {
            OverfittingClass::Excellent
        }
    }

    pub fn assess(&self, train: f64, test: f64, metric: Metric) -> OverfittingAssessment {
        let sign_reversal = if metric.higher_is_better() {
            train > 0.0 && test < 0.0
        } else {
            // Drawdown is a magnitude, there is no unfavorable sign to flip to
            false
        };

        let ratio = Self::ratio(train, test, metric);
        let flawless_test = !metric.higher_is_better() && train > 0.0 && test == 0.0;
        let classification = match ratio {
            None if flawless_test => OverfittingClass::Excellent,
            None => OverfittingClass::Undefined,
            Some(_) if sign_reversal => OverfittingClass::HighOverfitting,
            Some(r) => self.classify(r),
        };

        OverfittingAssessment {
            metric,
            train_value: train,
            test_value: test,
            ratio,
            classification,
            sign_reversal,
        }
    }
}
