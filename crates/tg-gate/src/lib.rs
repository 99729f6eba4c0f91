#![forbid(unsafe_code)]

pub mod abstention;
pub mod filter;
pub mod suppressor;

use serde::{Deserialize, Serialize};
use tg_types::{CalibrationBin, GateAdjustments, TypeError, find_bin, require_finite};

pub use abstention::{
    AbstentionConfig, AbstentionController, AbstentionOutcome, AbstentionReason,
    estimated_fp_risk,
};
pub use filter::{FilterConfig, FilterVerdict, HighConfidenceFilter, dynamic_threshold};
pub use suppressor::{
    FalsePositiveSuppressor, SuppressionResult, SuppressionVerdict, SuppressorConfig,
};

/// Independent evidence channels consulted per decision.
pub const CHANNEL_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSignal {
    pub active: bool,
    pub confidence: f64,
    pub stability: f64,
}

impl ChannelSignal {
    #[must_use]
    pub fn active(confidence: f64, stability: f64) -> Self {
        Self {
            active: true,
            confidence,
            stability,
        }
    }

    #[must_use]
    pub fn inactive() -> Self {
        Self {
            active: false,
            confidence: 0.0,
            stability: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub filter: FilterConfig,
    pub abstention: AbstentionConfig,
    pub suppressor: SuppressorConfig,
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        self.filter.validate()?;
        self.abstention.validate()?;
        self.suppressor.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    pub confidence: f64,
    pub channels: [ChannelSignal; CHANNEL_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Abstain,
    Quarantine,
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    InputValidation,
    HighConfidenceFilter,
    Abstention,
    FalsePositiveSuppressor,
}

/// Outcome of one pass through the gate, with every stage result that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub verdict: GateVerdict,
    pub decided_by: GateStage,
    pub effective_threshold: f64,
    pub filter: FilterVerdict,
    pub abstention: Option<AbstentionOutcome>,
    pub suppression: Option<SuppressionResult>,
    pub adjusted_confidence: f64,
    pub fp_risk: f64,
}

/// Filter, abstention and suppression run in order and short-circuit; no
/// later stage can relax an earlier rejection.
#[derive(Debug, Clone)]
pub struct DecisionGate {
    filter: HighConfidenceFilter,
    abstention: AbstentionController,
    suppressor: FalsePositiveSuppressor,
}

impl DecisionGate {
    pub fn new(config: GateConfig) -> Result<Self, TypeError> {
        Ok(Self {
            filter: HighConfidenceFilter::new(config.filter)?,
            abstention: AbstentionController::new(config.abstention)?,
            suppressor: FalsePositiveSuppressor::new(config.suppressor)?,
        })
    }

    #[must_use]
    pub fn filter(&self) -> &HighConfidenceFilter {
        &self.filter
    }

    pub fn load_bins(&mut self, bins: &[CalibrationBin]) -> f64 {
        self.filter.load_bins(bins)
    }

    pub fn lock_threshold(&mut self) {
        self.filter.lock();
    }

    #[must_use]
    pub fn evaluate(&self, request: &GateRequest, adjustments: GateAdjustments) -> GateDecision {
        let confidence = request.confidence;
        let fp_risk = estimated_fp_risk(confidence);
        let effective_threshold = self.filter.effective_threshold(adjustments);
        let filter = self.filter.filter(confidence, adjustments);

        let mut decision = GateDecision {
            verdict: GateVerdict::Pass,
            decided_by: GateStage::HighConfidenceFilter,
            effective_threshold,
            filter,
            abstention: None,
            suppression: None,
            adjusted_confidence: confidence,
            fp_risk,
        };

        if validate_request(request).is_err() {
            decision.verdict = GateVerdict::Abstain;
            decision.decided_by = GateStage::InputValidation;
            return finish(decision);
        }

        match filter {
            FilterVerdict::Abstain => {
                decision.verdict = GateVerdict::Abstain;
                return finish(decision);
            }
            FilterVerdict::Quarantine => {
                decision.verdict = GateVerdict::Quarantine;
                return finish(decision);
            }
            FilterVerdict::Pass => {}
        }

        let bin = find_bin(self.filter.bins(), confidence);
        let abstention = self.abstention.evaluate(
            confidence,
            effective_threshold,
            &request.channels,
            bin,
            adjustments,
        );
        decision.abstention = Some(abstention);
        if abstention.abstain {
            decision.verdict = GateVerdict::Abstain;
            decision.decided_by = GateStage::Abstention;
            decision.fp_risk = abstention.fp_risk;
            return finish(decision);
        }

        let suppression = self.suppressor.evaluate(confidence, &request.channels);
        decision.suppression = Some(suppression);
        decision.decided_by = GateStage::FalsePositiveSuppressor;
        decision.adjusted_confidence = suppression.adjusted_confidence;
        decision.verdict = match suppression.verdict {
            SuppressionVerdict::Allow => GateVerdict::Pass,
            SuppressionVerdict::NeedsReview => GateVerdict::Quarantine,
            SuppressionVerdict::SuppressFp => GateVerdict::Suppress,
        };
        finish(decision)
    }
}

fn finish(decision: GateDecision) -> GateDecision {
    #[cfg(feature = "tracing")]
    tracing::trace!(
        verdict = ?decision.verdict,
        stage = ?decision.decided_by,
        confidence = decision.adjusted_confidence,
        "gate decision"
    );
    decision
}

/// Reject a request carrying a non-finite headline confidence or an active
/// channel with a non-finite reading. [`DecisionGate::evaluate`] abstains on
/// such input.
pub fn validate_request(request: &GateRequest) -> Result<(), TypeError> {
    require_finite("confidence", request.confidence)?;
    for channel in request.channels.iter().filter(|channel| channel.active) {
        require_finite("channel.confidence", channel.confidence)?;
        require_finite("channel.stability", channel.stability)?;
    }
    Ok(())
}
