use serde::{Deserialize, Serialize};
use tg_types::{
    CalibrationBin, GateAdjustments, TypeError, population_variance, require_count_in,
    require_non_negative, require_unit_interval,
};

use crate::{CHANNEL_COUNT, ChannelSignal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbstentionConfig {
    pub agreement_threshold: f64,
    pub min_agreeing_channels: usize,
    pub max_calibration_gap: f64,
    pub max_channel_variance: f64,
}

impl Default for AbstentionConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: 0.70,
            min_agreeing_channels: 3,
            max_calibration_gap: 0.10,
            max_channel_variance: 0.15,
        }
    }
}

impl AbstentionConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_unit_interval("agreement_threshold", self.agreement_threshold)?;
        require_unit_interval("max_calibration_gap", self.max_calibration_gap)?;
        require_non_negative("max_channel_variance", self.max_channel_variance)?;
        require_count_in("min_agreeing_channels", self.min_agreeing_channels, 1, CHANNEL_COUNT)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbstentionReason {
    #[default]
    None,
    BelowThreshold {
        confidence: f64,
        threshold: f64,
    },
    InsufficientAgreement {
        agreeing: usize,
        required: usize,
        bar: f64,
    },
    CalibrationGap {
        gap: f64,
        limit: f64,
    },
    ChannelVariance {
        variance: f64,
        limit: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbstentionOutcome {
    pub abstain: bool,
    pub reason: AbstentionReason,
    pub fp_risk: f64,
}

/// Empirical false-positive rate by confidence band. Non-finite input maps
/// to the worst band.
#[must_use]
pub fn estimated_fp_risk(confidence: f64) -> f64 {
    if confidence.is_nan() || confidence < 0.50 {
        0.60
    } else if confidence < 0.73 {
        0.40
    } else if confidence < 0.93 {
        0.25
    } else if confidence < 0.97 {
        0.05
    } else {
        0.02
    }
}

/// Ordered abstention checks; the first hit wins. Prefers false negatives.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstentionController {
    config: AbstentionConfig,
}

impl AbstentionController {
    pub fn new(config: AbstentionConfig) -> Result<Self, TypeError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &AbstentionConfig {
        &self.config
    }

    /// `bin` is the calibration bin containing `confidence`, if any. Only
    /// active channels count toward agreement and variance.
    #[must_use]
    pub fn evaluate(
        &self,
        confidence: f64,
        threshold: f64,
        channels: &[ChannelSignal; CHANNEL_COUNT],
        bin: Option<&CalibrationBin>,
        adjustments: GateAdjustments,
    ) -> AbstentionOutcome {
        let reason = self.first_reason(confidence, threshold, channels, bin, adjustments);
        AbstentionOutcome {
            abstain: reason != AbstentionReason::None,
            reason,
            fp_risk: estimated_fp_risk(confidence),
        }
    }

    fn first_reason(
        &self,
        confidence: f64,
        threshold: f64,
        channels: &[ChannelSignal; CHANNEL_COUNT],
        bin: Option<&CalibrationBin>,
        adjustments: GateAdjustments,
    ) -> AbstentionReason {
        if confidence.is_nan() || confidence < threshold {
            return AbstentionReason::BelowThreshold {
                confidence,
                threshold,
            };
        }

        let bar = self.config.agreement_threshold + adjustments.abstention_band_adj.max(0.0);
        let agreeing = channels
            .iter()
            .filter(|channel| channel.active && channel.confidence > bar)
            .count();
        if agreeing < self.config.min_agreeing_channels {
            return AbstentionReason::InsufficientAgreement {
                agreeing,
                required: self.config.min_agreeing_channels,
                bar,
            };
        }

        if let Some(bin) = bin {
            let gap = bin.calibration_gap();
            if gap.is_nan() || gap > self.config.max_calibration_gap {
                return AbstentionReason::CalibrationGap {
                    gap,
                    limit: self.config.max_calibration_gap,
                };
            }
        }

        let active: Vec<f64> = channels
            .iter()
            .filter(|channel| channel.active)
            .map(|channel| channel.confidence)
            .collect();
        let variance = population_variance(&active).unwrap_or(f64::NAN);
        if variance.is_nan() || variance > self.config.max_channel_variance {
            return AbstentionReason::ChannelVariance {
                variance,
                limit: self.config.max_channel_variance,
            };
        }

        AbstentionReason::None
    }
}
