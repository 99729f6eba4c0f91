//! Per-field wiring of the monitors, the decision gate, the hash chain and
//! the containment controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_chain::{DecisionHashChain, DecisionInput};
use tg_determinism::{CrossDeviceValidator, DeterminismTolerances, DeterminismValidator};
use tg_freeze::{FreezeCheck, FreezeInvalidator, FreezeSnapshot, InvalidationEvent};
use tg_gate::{DecisionGate, GateDecision, GateRequest};
use tg_monitor::{
    DriftAction, DriftEvaluation, DriftMonitor, DriftState, MonitorError, PrecisionAction,
    PrecisionEvaluation, PrecisionMonitor, PrecisionState,
};
use tg_persist::PersistedState;
use tg_runtime::{
    ContainmentController, DigestFn, GovernanceMode, IncidentSigner, RuntimeError,
};
use tg_types::{CalibrationBin, DecisionOutcome, DriftSample, FieldId, UnixMillis, now_unix_ms};

use crate::config::{ConfigError, GovernanceConfig};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("state belongs to field {found}, not {expected}")]
    FieldMismatch { expected: FieldId, found: FieldId },
}

/// Everything the host knows about one decision at the time it is made.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveDecision<'a> {
    /// Ground truth, when the pipeline already has it.
    pub outcome: Option<DecisionOutcome>,
    pub drift_sample: DriftSample,
    pub gate: GateRequest,
    pub features: &'a [f64],
    pub logits: &'a [f64],
    pub temperature: f64,
    pub predicted_class: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedDecision {
    pub gate: GateDecision,
    pub sequence_id: u64,
    pub precision: Option<PrecisionEvaluation>,
    pub drift: Option<DriftEvaluation>,
    /// Containment engaged while processing this decision.
    pub contained: bool,
    pub mode: GovernanceMode,
    /// Model output may drive the shadow path. False in every mode other
    /// than `ModeBShadow`.
    pub model_authority: bool,
}

/// Live metrics compared against the certified snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub precision: f64,
    pub kl: f64,
    pub ece: f64,
    pub weight_hash: String,
    pub feature_dims: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeReport {
    pub certified: bool,
    pub breaches: Vec<InvalidationEvent>,
    pub contained: bool,
}

impl FreezeReport {
    #[must_use]
    pub fn held(&self) -> bool {
        self.certified && self.breaches.is_empty()
    }
}

/// One field's monitor set. Single writer: the host serializes calls per
/// field (see [`crate::FieldRegistry`]).
#[derive(Debug)]
pub struct FieldSupervisor {
    field_id: FieldId,
    precision: PrecisionMonitor,
    drift: DriftMonitor,
    gate: DecisionGate,
    chain: DecisionHashChain,
    containment: ContainmentController,
    freeze: FreezeInvalidator,
    tolerances: DeterminismTolerances,
    clock: fn() -> UnixMillis,
}

impl FieldSupervisor {
    pub fn new(
        field_id: FieldId,
        config: &GovernanceConfig,
        signer: Box<dyn IncidentSigner>,
        hasher: Box<dyn DigestFn>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        Ok(Self {
            precision: PrecisionMonitor::new(config.precision.clone())?,
            drift: DriftMonitor::new(config.drift.clone())?,
            gate: DecisionGate::new(config.gate.clone()).map_err(ConfigError::from)?,
            chain: DecisionHashChain::new(hasher),
            containment: ContainmentController::new(config.containment.clone(), signer)?,
            freeze: FreezeInvalidator::new(config.freeze.clone()).map_err(ConfigError::from)?,
            tolerances: config.determinism,
            clock: now_unix_ms,
            field_id,
        })
    }

    /// Replace the wall clock for incidents, freeze events and saved state.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> UnixMillis) -> Self {
        self.containment = self.containment.with_clock(clock);
        self.freeze = self.freeze.with_clock(clock);
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn field_id(&self) -> &FieldId {
        &self.field_id
    }

    #[must_use]
    pub fn mode(&self) -> GovernanceMode {
        self.containment.current_mode()
    }

    #[must_use]
    pub fn model_authority(&self) -> bool {
        self.mode() == GovernanceMode::ModeBShadow
    }

    #[must_use]
    pub fn containment(&self) -> &ContainmentController {
        &self.containment
    }

    /// Mode control (shadow enable, manual disable, unlock) goes through
    /// the controller directly.
    pub fn containment_mut(&mut self) -> &mut ContainmentController {
        &mut self.containment
    }

    #[must_use]
    pub fn chain(&self) -> &DecisionHashChain {
        &self.chain
    }

    #[must_use]
    pub fn gate(&self) -> &DecisionGate {
        &self.gate
    }

    #[must_use]
    pub fn freeze(&self) -> &FreezeInvalidator {
        &self.freeze
    }

    #[must_use]
    pub fn precision_state(&self) -> PrecisionState {
        self.precision.state()
    }

    #[must_use]
    pub fn drift_state(&self) -> DriftState {
        self.drift.state()
    }

    /// Feed calibration bins to the gate filter. Returns the threshold in
    /// force afterwards.
    pub fn load_calibration(&mut self, bins: &[CalibrationBin]) -> f64 {
        self.gate.load_bins(bins)
    }

    pub fn process(&mut self, decision: LiveDecision<'_>) -> SupervisedDecision {
        let precision = decision
            .outcome
            .and_then(|outcome| self.precision.record(outcome));
        let drift = self.drift.record(decision.drift_sample);

        let mut contained = false;
        if let Some(evaluation) = &precision {
            contained |= self.forward_precision(evaluation);
        }
        if let Some(evaluation) = &drift {
            contained |= self.forward_drift(evaluation);
        }

        let gate = self.gate.evaluate(&decision.gate, self.drift.adjustments());
        let sequence_id = self
            .chain
            .record_decision(DecisionInput {
                features: decision.features,
                logits: decision.logits,
                temperature: decision.temperature,
                predicted_class: decision.predicted_class,
                confidence: decision.gate.confidence,
            })
            .sequence_id;

        let mode = self.mode();
        SupervisedDecision {
            gate,
            sequence_id,
            precision,
            drift,
            contained,
            mode,
            model_authority: mode == GovernanceMode::ModeBShadow,
        }
    }

    // While locked, further breaches are not re-forwarded: the first
    // incident already holds the lock.
    fn forward_precision(&mut self, evaluation: &PrecisionEvaluation) -> bool {
        if self.containment.is_locked() || evaluation.action != PrecisionAction::EmergencyHalt {
            return false;
        }
        // A latched halt keeps breaching with the drop that latched it until
        // the monitor is reset, however small the latest drop is.
        evaluation
            .latched_drop
            .or(evaluation.drop)
            .is_some_and(|drop| self.containment.check_rapid_precision_drop(drop))
    }

    // At most one incident per evaluation; the first breached trigger wins.
    fn forward_drift(&mut self, evaluation: &DriftEvaluation) -> bool {
        if self.containment.is_locked() || evaluation.insufficient_data {
            return false;
        }
        if evaluation.action == DriftAction::Containment
            && self
                .containment
                .check_kl_divergence(evaluation.kl, evaluation.contain_threshold)
        {
            return true;
        }
        self.containment
            .check_entropy_collapse(evaluation.entropy_collapse)
            || self
                .containment
                .check_drift_spike(evaluation.confidence_shift_sigma)
            || self
                .containment
                .check_calibration_inflation(evaluation.confidence_inflation)
    }

    /// Clear the containment lock after an out-of-band revalidation and
    /// restart the precision monitor, dropping any latched emergency halt.
    /// Drift baselines are kept. Returns false when nothing was locked.
    pub fn revalidate(&mut self, note: impl Into<String>) -> bool {
        if !self.containment.unlock_after_revalidation(note) {
            return false;
        }
        self.precision.reset();
        #[cfg(feature = "tracing")]
        tracing::info!(field_id = %self.field_id, "field revalidated");
        true
    }

    /// Store the certification snapshot and freeze the gate threshold.
    pub fn certify(&mut self, snapshot: FreezeSnapshot) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            field_id = %self.field_id,
            weight_hash = %snapshot.weight_hash,
            "field certified"
        );
        self.freeze.set_snapshot(snapshot);
        self.gate.lock_threshold();
    }

    /// Run every freeze check against `live`. Any breach is forwarded to
    /// containment as one incident naming each failed check.
    pub fn run_freeze_checks(&mut self, live: &LiveMetrics) -> FreezeReport {
        let checks = [
            self.freeze.check_precision(live.precision),
            self.freeze.check_kl_drift(live.kl),
            self.freeze.check_ece(live.ece),
            self.freeze.check_hash(&live.weight_hash),
            self.freeze.check_dimensions(live.feature_dims),
        ];
        let certified = !checks
            .iter()
            .any(|check| matches!(check, FreezeCheck::NoSnapshot));
        let breaches: Vec<InvalidationEvent> = checks
            .into_iter()
            .filter_map(|check| match check {
                FreezeCheck::Breached(event) => Some(event),
                FreezeCheck::Held | FreezeCheck::NoSnapshot => None,
            })
            .collect();

        let contained = !breaches.is_empty() && {
            let reasons = breaches
                .iter()
                .map(|event| event.reason.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            self.containment.check_freeze_invalidation(reasons)
        };
        FreezeReport {
            certified,
            breaches,
            contained,
        }
    }

    #[must_use]
    pub fn run_validator(&self) -> DeterminismValidator {
        DeterminismValidator::new(self.tolerances.runs)
    }

    #[must_use]
    pub fn device_validator(&self) -> CrossDeviceValidator {
        CrossDeviceValidator::new(self.tolerances.devices)
    }

    #[must_use]
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState::new(
            self.field_id.clone(),
            (self.clock)(),
            self.precision.baseline(),
            self.drift.baseline(),
        )
    }

    /// Re-seed monitor baselines from a saved state for the same field.
    pub fn restore(&mut self, state: &PersistedState) -> Result<(), SupervisorError> {
        if state.field_id != self.field_id {
            return Err(SupervisorError::FieldMismatch {
                expected: self.field_id.clone(),
                found: state.field_id.clone(),
            });
        }
        self.precision.restore(&state.precision);
        self.drift.restore(&state.drift);
        Ok(())
    }
}
