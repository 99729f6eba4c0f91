use serde::{Deserialize, Serialize};
use tg_types::{
    TypeError, mean, require_count_in, require_non_negative, require_unit_interval,
};

use crate::{CHANNEL_COUNT, ChannelSignal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressorConfig {
    pub min_active_channels: usize,
    pub missing_channel_penalty: f64,
    pub agreement_floor: f64,
    pub agreement_penalty: f64,
    pub stability_floor: f64,
    pub stability_penalty: f64,
    pub allow_at: f64,
    pub review_at: f64,
}

impl Default for SuppressorConfig {
    fn default() -> Self {
        Self {
            min_active_channels: 3,
            missing_channel_penalty: 0.10,
            agreement_floor: 0.80,
            agreement_penalty: 0.15,
            stability_floor: 0.70,
            stability_penalty: 0.10,
            allow_at: 0.80,
            review_at: 0.50,
        }
    }
}

impl SuppressorConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_non_negative("missing_channel_penalty", self.missing_channel_penalty)?;
        require_unit_interval("agreement_floor", self.agreement_floor)?;
        require_non_negative("agreement_penalty", self.agreement_penalty)?;
        require_unit_interval("stability_floor", self.stability_floor)?;
        require_non_negative("stability_penalty", self.stability_penalty)?;
        let allow = require_unit_interval("allow_at", self.allow_at)?;
        let review = require_unit_interval("review_at", self.review_at)?;
        if review > allow {
            return Err(TypeError::InvertedBin {
                lower: review,
                upper: allow,
            });
        }
        require_count_in("min_active_channels", self.min_active_channels, 1, CHANNEL_COUNT)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionVerdict {
    Allow,
    NeedsReview,
    SuppressFp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuppressionResult {
    pub verdict: SuppressionVerdict,
    pub active_channels: usize,
    pub agreement: f64,
    pub stability: f64,
    pub penalty: f64,
    pub adjusted_confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FalsePositiveSuppressor {
    config: SuppressorConfig,
}

impl FalsePositiveSuppressor {
    pub fn new(config: SuppressorConfig) -> Result<Self, TypeError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &SuppressorConfig {
        &self.config
    }

    #[must_use]
    pub fn evaluate(
        &self,
        confidence: f64,
        channels: &[ChannelSignal; CHANNEL_COUNT],
    ) -> SuppressionResult {
        let active: Vec<&ChannelSignal> = channels.iter().filter(|c| c.active).collect();
        let missing = CHANNEL_COUNT - active.len();

        let agreement = pairwise_agreement(&active);
        let stability = mean(&active.iter().map(|c| c.stability).collect::<Vec<_>>()).unwrap_or(0.0);

        let mut penalty = missing as f64 * self.config.missing_channel_penalty;
        if agreement.is_nan() || agreement < self.config.agreement_floor {
            penalty += self.config.agreement_penalty;
        }
        if stability.is_nan() || stability < self.config.stability_floor {
            penalty += self.config.stability_penalty;
        }
        let adjusted_confidence = confidence - penalty;

        let verdict = if active.len() < self.config.min_active_channels {
            SuppressionVerdict::SuppressFp
        } else if adjusted_confidence >= self.config.allow_at {
            SuppressionVerdict::Allow
        } else if adjusted_confidence >= self.config.review_at {
            SuppressionVerdict::NeedsReview
        } else {
            SuppressionVerdict::SuppressFp
        };

        SuppressionResult {
            verdict,
            active_channels: active.len(),
            agreement,
            stability,
            penalty,
            adjusted_confidence,
        }
    }
}

/// Mean of `1 - |a - b|` over every active pair; 0 with fewer than two.
fn pairwise_agreement(active: &[&ChannelSignal]) -> f64 {
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, left) in active.iter().enumerate() {
        for right in &active[i + 1..] {
            sum += 1.0 - (left.confidence - right.confidence).abs();
            pairs += 1;
        }
    }
    if pairs == 0 { 0.0 } else { sum / pairs as f64 }
}
