#![forbid(unsafe_code)]

pub mod audit_f64;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-supplied wall-clock instant in unix milliseconds.
pub type UnixMillis = u64;

/// Named decision-making context. Every field owns an isolated monitor set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    TruePositive,
    FalsePositive,
    TrueNegative,
    FalseNegative,
}

/// One labelled classifier decision. Produced by the external pipeline once
/// ground truth is known; never mutated after it is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub predicted_positive: bool,
    pub actually_positive: bool,
    pub confidence: f64,
    pub timestamp_ms: UnixMillis,
}

impl DecisionOutcome {
    #[must_use]
    pub fn new(
        predicted_positive: bool,
        actually_positive: bool,
        confidence: f64,
        timestamp_ms: UnixMillis,
    ) -> Self {
        Self {
            predicted_positive,
            actually_positive,
            confidence,
            timestamp_ms,
        }
    }

    #[must_use]
    pub fn class(&self) -> OutcomeClass {
        match (self.predicted_positive, self.actually_positive) {
            (true, true) => OutcomeClass::TruePositive,
            (true, false) => OutcomeClass::FalsePositive,
            (false, false) => OutcomeClass::TrueNegative,
            (false, true) => OutcomeClass::FalseNegative,
        }
    }
}

/// Distributional signal for one decision, consumed by the drift monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSample {
    pub confidence: f64,
    pub feature_entropy: f64,
    /// Near-duplicate risk on a 0..=100 scale.
    pub duplicate_risk_score: f64,
    pub timestamp_ms: UnixMillis,
}

impl DriftSample {
    #[must_use]
    pub fn new(
        confidence: f64,
        feature_entropy: f64,
        duplicate_risk_score: f64,
        timestamp_ms: UnixMillis,
    ) -> Self {
        Self {
            confidence,
            feature_entropy,
            duplicate_risk_score,
            timestamp_ms,
        }
    }
}

/// Additive tightening the drift monitor asks the decision gate to apply on
/// top of its static thresholds. Both knobs are non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GateAdjustments {
    pub confidence_threshold_adj: f64,
    pub abstention_band_adj: f64,
}

/// Reliability-diagram bin: observed accuracy for decisions whose confidence
/// fell in `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub samples: u64,
    pub mean_confidence: f64,
    pub mean_accuracy: f64,
}

impl CalibrationBin {
    pub fn new(
        lower: f64,
        upper: f64,
        samples: u64,
        mean_confidence: f64,
        mean_accuracy: f64,
    ) -> Result<Self, TypeError> {
        let lower = require_unit_interval("lower", lower)?;
        let upper = require_unit_interval("upper", upper)?;
        if lower >= upper {
            return Err(TypeError::InvertedBin { lower, upper });
        }
        Ok(Self {
            lower,
            upper,
            samples,
            mean_confidence: require_unit_interval("mean_confidence", mean_confidence)?,
            mean_accuracy: require_unit_interval("mean_accuracy", mean_accuracy)?,
        })
    }

    /// The top bin is closed so a confidence of exactly 1.0 has a home.
    #[must_use]
    pub fn contains(&self, confidence: f64) -> bool {
        confidence >= self.lower
            && (confidence < self.upper || (self.upper >= 1.0 && confidence <= self.upper))
    }

    #[must_use]
    pub fn calibration_gap(&self) -> f64 {
        (self.mean_confidence - self.mean_accuracy).abs()
    }
}

/// Sample-weighted mean gap between confidence and accuracy. Zero when the
/// bins carry no samples.
#[must_use]
pub fn expected_calibration_error(bins: &[CalibrationBin]) -> f64 {
    let total: u64 = bins.iter().map(|bin| bin.samples).sum();
    if total == 0 {
        return 0.0;
    }
    let weighted: f64 = bins
        .iter()
        .map(|bin| bin.samples as f64 * bin.calibration_gap())
        .sum();
    weighted / total as f64
}

#[must_use]
pub fn find_bin(bins: &[CalibrationBin], confidence: f64) -> Option<&CalibrationBin> {
    bins.iter().find(|bin| bin.contains(confidence))
}

#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[must_use]
pub fn population_variance(values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    Some(values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64)
}

/// Clamp into `[0, 1]`, replacing non-finite input with a conservative value.
#[must_use]
pub fn sanitize_unit(value: f64, conservative_default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        conservative_default
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("{field} must be finite but was {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("{field} must lie in [0, 1] but was {value}")]
    OutOfUnitInterval { field: &'static str, value: f64 },
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
    #[error("{field} must not be negative but was {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("{field} must lie in [{min}, {max}] but was {value}")]
    CountOutOfRange {
        field: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
    #[error("calibration bin is inverted: lower={lower} upper={upper}")]
    InvertedBin { lower: f64, upper: f64 },
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
}

pub fn require_finite(field: &'static str, value: f64) -> Result<f64, TypeError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TypeError::NonFinite { field, value })
    }
}

pub fn require_unit_interval(field: &'static str, value: f64) -> Result<f64, TypeError> {
    let value = require_finite(field, value)?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(TypeError::OutOfUnitInterval { field, value })
    }
}

pub fn require_non_negative(field: &'static str, value: f64) -> Result<f64, TypeError> {
    let value = require_finite(field, value)?;
    if value >= 0.0 {
        Ok(value)
    } else {
        Err(TypeError::Negative { field, value })
    }
}

pub fn require_positive_count(field: &'static str, value: usize) -> Result<usize, TypeError> {
    if value == 0 {
        Err(TypeError::NonPositive { field })
    } else {
        Ok(value)
    }
}

pub fn require_count_in(
    field: &'static str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<usize, TypeError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(TypeError::CountOutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

pub fn try_now_unix_ms() -> Result<UnixMillis, TypeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TypeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

/// Wall-clock unix milliseconds; 0 when the clock reads before the epoch.
#[must_use]
pub fn now_unix_ms() -> UnixMillis {
    try_now_unix_ms().unwrap_or_default()
}
