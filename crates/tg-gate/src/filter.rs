use serde::{Deserialize, Serialize};
use tg_types::{CalibrationBin, GateAdjustments, TypeError, require_unit_interval};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub target_precision: f64,
    pub initial_threshold: f64,
    pub quarantine_lower: f64,
    pub quarantine_upper: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            target_precision: 0.95,
            initial_threshold: 0.93,
            quarantine_lower: 0.73,
            quarantine_upper: 0.93,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_unit_interval("target_precision", self.target_precision)?;
        require_unit_interval("initial_threshold", self.initial_threshold)?;
        let lower = require_unit_interval("quarantine_lower", self.quarantine_lower)?;
        let upper = require_unit_interval("quarantine_upper", self.quarantine_upper)?;
        if lower > upper {
            return Err(TypeError::InvertedBin { lower, upper });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterVerdict {
    Pass,
    Quarantine,
    Abstain,
}

/// Calibration-derived confidence threshold with an optional ratchet.
#[derive(Debug, Clone, PartialEq)]
pub struct HighConfidenceFilter {
    config: FilterConfig,
    threshold: f64,
    locked: bool,
    bins: Vec<CalibrationBin>,
}

impl HighConfidenceFilter {
    pub fn new(config: FilterConfig) -> Result<Self, TypeError> {
        config.validate()?;
        Ok(Self {
            threshold: config.initial_threshold,
            config,
            locked: false,
            bins: Vec::new(),
        })
    }

    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[must_use]
    pub fn bins(&self) -> &[CalibrationBin] {
        &self.bins
    }

    /// After locking, recomputation can only raise the threshold.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Replace the calibration bins and recompute the threshold. Returns the
    /// threshold now in force.
    pub fn load_bins(&mut self, bins: &[CalibrationBin]) -> f64 {
        self.bins = bins.to_vec();
        let computed = dynamic_threshold(bins, self.config.target_precision);
        let next = if self.locked {
            self.threshold.max(computed)
        } else {
            computed
        };
        #[cfg(feature = "tracing")]
        if next != self.threshold {
            tracing::info!(
                previous = self.threshold,
                threshold = next,
                locked = self.locked,
                "confidence threshold recomputed"
            );
        }
        self.threshold = next;
        next
    }

    #[must_use]
    pub fn effective_threshold(&self, adjustments: GateAdjustments) -> f64 {
        (self.threshold + adjustments.confidence_threshold_adj.max(0.0)).min(1.0)
    }

    #[must_use]
    pub fn filter(&self, confidence: f64, adjustments: GateAdjustments) -> FilterVerdict {
        if !confidence.is_finite() {
            return FilterVerdict::Abstain;
        }
        if confidence >= self.effective_threshold(adjustments) {
            FilterVerdict::Pass
        } else if confidence >= self.config.quarantine_lower
            && confidence < self.config.quarantine_upper
        {
            FilterVerdict::Quarantine
        } else {
            FilterVerdict::Abstain
        }
    }
}

/// Walk bins from the most confident down, accumulating sample-weighted
/// accuracy; the threshold is the lowest bin edge at which cumulative
/// precision still meets `target`. 1.0 when even the top bin misses.
#[must_use]
pub fn dynamic_threshold(bins: &[CalibrationBin], target: f64) -> f64 {
    let mut ordered: Vec<&CalibrationBin> = bins.iter().filter(|bin| bin.samples > 0).collect();
    ordered.sort_by(|a, b| b.lower.total_cmp(&a.lower));

    let mut correct = 0.0;
    let mut total = 0.0;
    let mut threshold = 1.0;
    for bin in ordered {
        correct += bin.samples as f64 * bin.mean_accuracy;
        total += bin.samples as f64;
        if correct / total >= target {
            threshold = bin.lower;
        } else {
            break;
        }
    }
    threshold
}
