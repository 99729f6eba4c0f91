#![forbid(unsafe_code)]

pub mod integrity;

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_types::audit_f64::canonical_bits;
use tg_types::{TypeError, UnixMillis, now_unix_ms, require_finite, require_non_negative};

pub use integrity::{
    DIGEST_LEN, Digest32, DigestFn, HmacSha256Signer, IncidentSigner, IntegrityError,
    Sha256Digest, digest_hex,
};

const MS_PER_DAY: f64 = 86_400_000.0;

/// Authority level granted to the supervised model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceMode {
    /// Human-only decisions.
    #[default]
    ModeAOnly,
    /// Model runs alongside with zero authority.
    ModeBShadow,
    /// Human-only plus lock; only revalidation leaves it.
    Containment,
}

impl GovernanceMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModeAOnly => "mode_a_only",
            Self::ModeBShadow => "mode_b_shadow",
            Self::Containment => "containment",
        }
    }
}

impl fmt::Display for GovernanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    DriftSpike,
    EntropyCollapse,
    CalibrationInflation,
    ConsensusDivergence,
    ModelAging,
    RapidPrecisionDrop,
    KlDivergence,
    FreezeInvalidated,
}

impl TriggerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriftSpike => "drift_spike",
            Self::EntropyCollapse => "entropy_collapse",
            Self::CalibrationInflation => "calibration_inflation",
            Self::ConsensusDivergence => "consensus_divergence",
            Self::ModelAging => "model_aging",
            Self::RapidPrecisionDrop => "rapid_precision_drop",
            Self::KlDivergence => "kl_divergence",
            Self::FreezeInvalidated => "freeze_invalidated",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed, append-only record of one containment engagement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainmentIncident {
    pub incident_id: u64,
    pub timestamp_ms: UnixMillis,
    pub trigger: TriggerKind,
    pub previous_mode: GovernanceMode,
    pub new_mode: GovernanceMode,
    #[serde(with = "tg_types::audit_f64")]
    pub trigger_value: f64,
    #[serde(with = "tg_types::audit_f64")]
    pub threshold: f64,
    pub description: String,
    pub signature: String,
    pub governance_notified: bool,
}

impl ContainmentIncident {
    /// Bytes covered by the signature. Floats are encoded by bit pattern,
    /// with every NaN collapsed to one pattern, so an incident read back from
    /// an export still verifies.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{:016x}|{:016x}|{}",
            self.incident_id,
            self.timestamp_ms,
            self.trigger,
            self.previous_mode,
            self.new_mode,
            canonical_bits(self.trigger_value),
            canonical_bits(self.threshold),
            self.description
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    ShadowEnabled,
    ManualDisable,
    Revalidated,
}

/// Audit entry for a mode change that is not a containment incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: GovernanceMode,
    pub to: GovernanceMode,
    pub at_ms: UnixMillis,
    pub cause: TransitionCause,
    pub note: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentLedger {
    incidents: Vec<ContainmentIncident>,
    transitions: Vec<ModeTransition>,
}

impl IncidentLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_incident(&mut self, incident: ContainmentIncident) {
        self.incidents.push(incident);
    }

    pub fn push_transition(&mut self, transition: ModeTransition) {
        self.transitions.push(transition);
    }

    #[must_use]
    pub fn incidents(&self) -> &[ContainmentIncident] {
        &self.incidents
    }

    #[must_use]
    pub fn transitions(&self) -> &[ModeTransition] {
        &self.transitions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentConfig {
    pub drift_spike_sigma: f64,
    pub entropy_collapse: f64,
    pub calibration_inflation: f64,
    pub consensus_divergence: f64,
    pub model_aging_days: f64,
    pub rapid_precision_drop: f64,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self {
            drift_spike_sigma: 2.0,
            entropy_collapse: 0.10,
            calibration_inflation: 0.02,
            consensus_divergence: 0.03,
            model_aging_days: 90.0,
            rapid_precision_drop: 0.25,
        }
    }
}

impl ContainmentConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_non_negative("drift_spike_sigma", self.drift_spike_sigma)?;
        require_non_negative("entropy_collapse", self.entropy_collapse)?;
        require_non_negative("calibration_inflation", self.calibration_inflation)?;
        require_non_negative("consensus_divergence", self.consensus_divergence)?;
        require_non_negative("model_aging_days", self.model_aging_days)?;
        require_finite("rapid_precision_drop", self.rapid_precision_drop)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] TypeError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Single point of mode authority for one field.
///
/// Any trigger breach forces human-only operation and latches `locked`;
/// [`ContainmentController::unlock_after_revalidation`] is the only way out.
#[derive(Debug)]
pub struct ContainmentController {
    config: ContainmentConfig,
    mode: GovernanceMode,
    locked: bool,
    next_incident_id: u64,
    ledger: IncidentLedger,
    signer: Box<dyn IncidentSigner>,
    clock: fn() -> UnixMillis,
}

impl ContainmentController {
    pub fn new(
        config: ContainmentConfig,
        signer: Box<dyn IncidentSigner>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self {
            config,
            mode: GovernanceMode::ModeAOnly,
            locked: false,
            next_incident_id: 1,
            ledger: IncidentLedger::new(),
            signer,
            clock: now_unix_ms,
        })
    }

    pub fn with_hmac_key(config: ContainmentConfig, key: &[u8]) -> Result<Self, RuntimeError> {
        let signer = HmacSha256Signer::new(key)?;
        Self::new(config, Box::new(signer))
    }

    /// Replace the wall clock used to stamp incidents and transitions.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> UnixMillis) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ContainmentConfig {
        &self.config
    }

    #[must_use]
    pub fn current_mode(&self) -> GovernanceMode {
        if self.locked {
            GovernanceMode::Containment
        } else {
            self.mode
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Engage containment when `value` exceeds `threshold`. A NaN on either
    /// side counts as a breach.
    pub fn check_and_contain(
        &mut self,
        trigger: TriggerKind,
        value: f64,
        threshold: f64,
        description: impl Into<String>,
    ) -> bool {
        if value <= threshold {
            return false;
        }

        let previous_mode = self.current_mode();
        let mut incident = ContainmentIncident {
            incident_id: self.next_incident_id,
            timestamp_ms: (self.clock)(),
            trigger,
            previous_mode,
            new_mode: GovernanceMode::Containment,
            trigger_value: value,
            threshold,
            description: description.into(),
            signature: String::new(),
            governance_notified: false,
        };
        incident.signature = self.signer.sign(&incident.canonical_bytes());

        self.mode = GovernanceMode::ModeAOnly;
        self.locked = true;
        self.next_incident_id += 1;
        incident.governance_notified = true;

        #[cfg(feature = "tracing")]
        tracing::warn!(
            incident_id = incident.incident_id,
            trigger = %trigger,
            value,
            threshold,
            previous_mode = %previous_mode,
            "containment engaged"
        );

        self.ledger.push_incident(incident);
        true
    }

    /// Grant shadow mode. Refused while locked.
    pub fn enable_shadow_mode(&mut self) -> bool {
        if self.locked {
            return false;
        }
        if self.mode != GovernanceMode::ModeBShadow {
            self.transition(
                GovernanceMode::ModeBShadow,
                TransitionCause::ShadowEnabled,
                String::new(),
            );
        }
        true
    }

    /// Manually return to human-only decisions. Returns whether the mode
    /// changed.
    pub fn disable_ai(&mut self, note: impl Into<String>) -> bool {
        if self.locked || self.mode == GovernanceMode::ModeAOnly {
            return false;
        }
        self.transition(
            GovernanceMode::ModeAOnly,
            TransitionCause::ManualDisable,
            note.into(),
        );
        true
    }

    /// Clear the lock after an out-of-band revalidation. Lands in shadow
    /// mode; false when nothing was locked.
    pub fn unlock_after_revalidation(&mut self, note: impl Into<String>) -> bool {
        if !self.locked {
            return false;
        }
        self.transition(
            GovernanceMode::ModeBShadow,
            TransitionCause::Revalidated,
            note.into(),
        );
        self.locked = false;
        true
    }

    fn transition(&mut self, to: GovernanceMode, cause: TransitionCause, note: String) {
        let from = self.current_mode();
        let at_ms = (self.clock)();
        #[cfg(feature = "tracing")]
        tracing::info!(from = %from, to = %to, ?cause, "governance mode transition");
        self.mode = to;
        self.ledger.push_transition(ModeTransition {
            from,
            to,
            at_ms,
            cause,
            note,
        });
    }

    pub fn check_drift_spike(&mut self, sigma: f64) -> bool {
        let threshold = self.config.drift_spike_sigma;
        self.check_and_contain(
            TriggerKind::DriftSpike,
            sigma,
            threshold,
            format!("confidence shifted {sigma:.3} sigma from baseline"),
        )
    }

    pub fn check_entropy_collapse(&mut self, fraction: f64) -> bool {
        let threshold = self.config.entropy_collapse;
        self.check_and_contain(
            TriggerKind::EntropyCollapse,
            fraction,
            threshold,
            format!("feature entropy collapsed by {:.1}%", fraction * 100.0),
        )
    }

    pub fn check_calibration_inflation(&mut self, delta: f64) -> bool {
        let threshold = self.config.calibration_inflation;
        self.check_and_contain(
            TriggerKind::CalibrationInflation,
            delta,
            threshold,
            format!("mean confidence inflated by {delta:.4}"),
        )
    }

    pub fn check_consensus_divergence(&mut self, fraction: f64) -> bool {
        let threshold = self.config.consensus_divergence;
        self.check_and_contain(
            TriggerKind::ConsensusDivergence,
            fraction,
            threshold,
            format!("{:.1}% of decisions diverged from consensus", fraction * 100.0),
        )
    }

    /// Breach when the model was last validated more than the configured
    /// number of days before `now_ms`. Timestamps chrono cannot represent
    /// count as infinitely old.
    pub fn check_model_aging(&mut self, validated_at_ms: UnixMillis, now_ms: UnixMillis) -> bool {
        let age_days = model_age_days(validated_at_ms, now_ms);
        let threshold = self.config.model_aging_days;
        self.check_and_contain(
            TriggerKind::ModelAging,
            age_days,
            threshold,
            format!("model last validated {age_days:.1} days ago"),
        )
    }

    pub fn check_rapid_precision_drop(&mut self, drop: f64) -> bool {
        let threshold = self.config.rapid_precision_drop;
        self.check_and_contain(
            TriggerKind::RapidPrecisionDrop,
            drop,
            threshold,
            format!("rolling precision dropped by {drop:.4} between evaluations"),
        )
    }

    pub fn check_kl_divergence(&mut self, kl: f64, contain_threshold: f64) -> bool {
        self.check_and_contain(
            TriggerKind::KlDivergence,
            kl,
            contain_threshold,
            format!("approximate KL divergence {kl:.4} above {contain_threshold:.4}"),
        )
    }

    pub fn check_freeze_invalidation(&mut self, reason: impl fmt::Display) -> bool {
        self.check_and_contain(
            TriggerKind::FreezeInvalidated,
            1.0,
            0.0,
            format!("freeze snapshot invalidated: {reason}"),
        )
    }

    #[must_use]
    pub fn incidents(&self) -> &[ContainmentIncident] {
        self.ledger.incidents()
    }

    #[must_use]
    pub fn transitions(&self) -> &[ModeTransition] {
        self.ledger.transitions()
    }

    #[must_use]
    pub fn ledger(&self) -> &IncidentLedger {
        &self.ledger
    }

    #[must_use]
    pub fn verify_incident(&self, incident: &ContainmentIncident) -> bool {
        self.signer
            .verify(&incident.canonical_bytes(), &incident.signature)
    }

    #[must_use]
    pub fn incident_card(&self, incident: &ContainmentIncident) -> IncidentCard {
        incident_to_card(incident, self.verify_incident(incident))
    }
}

#[must_use]
pub fn model_age_days(validated_at_ms: UnixMillis, now_ms: UnixMillis) -> f64 {
    let (Some(validated), Some(now)) = (to_datetime(validated_at_ms), to_datetime(now_ms)) else {
        return f64::INFINITY;
    };
    let age = now.signed_duration_since(validated);
    (age.num_milliseconds().max(0) as f64) / MS_PER_DAY
}

fn to_datetime(ms: UnixMillis) -> Option<DateTime<Utc>> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

/// RFC 3339 rendering of a unix-millisecond timestamp.
#[must_use]
pub fn format_timestamp(ms: UnixMillis) -> String {
    to_datetime(ms).map_or_else(
        || format!("{ms}ms"),
        |dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

/// Human-facing rendering of an incident. Structured data stays in
/// [`ContainmentIncident`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentCard {
    pub title: String,
    pub summary: String,
    pub detail: String,
    pub guidance: String,
}

impl IncidentCard {
    #[must_use]
    pub fn render_plain(&self) -> String {
        format!(
            "[{}]\n{}\n{}\n{}",
            self.title, self.summary, self.detail, self.guidance
        )
    }
}

#[must_use]
pub fn incident_to_card(incident: &ContainmentIncident, signature_valid: bool) -> IncidentCard {
    IncidentCard {
        title: format!(
            "containment #{}::{}",
            incident.incident_id, incident.trigger
        ),
        summary: format!(
            "value={:.4} threshold={:.4} at {}",
            incident.trigger_value,
            incident.threshold,
            format_timestamp(incident.timestamp_ms)
        ),
        detail: format!(
            "{} -> {}: {} (signature {})",
            incident.previous_mode,
            incident.new_mode,
            incident.description,
            if signature_valid { "verified" } else { "INVALID" }
        ),
        guidance: "Model authority revoked; revalidate the field before unlocking into shadow mode."
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ContainmentConfig, ContainmentController, ContainmentIncident, GovernanceMode,
        HmacSha256Signer, IncidentSigner, TransitionCause, TriggerKind, format_timestamp,
        model_age_days,
    };

    const DAY_MS: u64 = 86_400_000;

    fn fixed_clock() -> u64 {
        1_700_000_000_000
    }

    fn controller() -> ContainmentController {
        ContainmentController::with_hmac_key(ContainmentConfig::default(), b"test-key")
            .expect("controller")
            .with_clock(fixed_clock)
    }

    #[test]
    fn starts_human_only_and_unlocked() {
        let ctl = controller();
        assert_eq!(ctl.current_mode(), GovernanceMode::ModeAOnly);
        assert!(!ctl.is_locked());
        assert!(ctl.incidents().is_empty());
    }

    #[test]
    fn value_at_threshold_does_not_contain() {
        let mut ctl = controller();
        assert!(!ctl.check_drift_spike(2.0));
        assert!(!ctl.check_entropy_collapse(0.05));
        assert!(ctl.incidents().is_empty());
        assert!(!ctl.is_locked());
    }

    #[test]
    fn breach_locks_signs_and_appends() {
        let mut ctl = controller();
        assert!(ctl.enable_shadow_mode());
        assert!(ctl.check_drift_spike(2.5));

        assert!(ctl.is_locked());
        assert_eq!(ctl.current_mode(), GovernanceMode::Containment);
        let incident = &ctl.incidents()[0];
        assert_eq!(incident.incident_id, 1);
        assert_eq!(incident.trigger, TriggerKind::DriftSpike);
        assert_eq!(incident.previous_mode, GovernanceMode::ModeBShadow);
        assert_eq!(incident.new_mode, GovernanceMode::Containment);
        assert_eq!(incident.timestamp_ms, fixed_clock());
        assert!(incident.governance_notified);
        assert!(ctl.verify_incident(incident));
    }

    #[test]
    fn nan_value_is_a_breach() {
        let mut ctl = controller();
        assert!(ctl.check_calibration_inflation(f64::NAN));
        assert!(ctl.is_locked());
        assert!(ctl.verify_incident(&ctl.incidents()[0]));
    }

    #[test]
    fn nan_incident_survives_json_and_still_verifies() {
        let mut ctl = controller();
        assert!(ctl.check_drift_spike(-f64::NAN));
        let json = serde_json::to_string(&ctl.incidents()[0]).expect("serialize");
        assert!(json.contains(r#""trigger_value":"NaN""#));
        let back: ContainmentIncident = serde_json::from_str(&json).expect("deserialize");
        assert!(back.trigger_value.is_nan());
        assert_eq!(back.threshold, 2.0);
        assert!(ctl.verify_incident(&back));
    }

    #[test]
    fn shadow_is_refused_while_locked_and_unlock_lands_in_shadow() {
        let mut ctl = controller();
        assert!(ctl.check_consensus_divergence(0.10));
        assert!(!ctl.enable_shadow_mode());
        assert_eq!(ctl.current_mode(), GovernanceMode::Containment);

        assert!(ctl.unlock_after_revalidation("re-certified on holdout set"));
        assert!(!ctl.is_locked());
        assert_eq!(ctl.current_mode(), GovernanceMode::ModeBShadow);
        assert!(!ctl.unlock_after_revalidation("again"));

        let last = ctl.transitions().last().expect("transition");
        assert_eq!(last.cause, TransitionCause::Revalidated);
        assert_eq!(last.from, GovernanceMode::Containment);
        assert_eq!(last.to, GovernanceMode::ModeBShadow);
    }

    #[test]
    fn incident_ids_increase_across_repeat_breaches() {
        let mut ctl = controller();
        assert!(ctl.check_rapid_precision_drop(0.4));
        assert!(ctl.check_kl_divergence(0.9, 0.45));
        let ids: Vec<u64> = ctl.incidents().iter().map(|i| i.incident_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(ctl.incidents()[1].previous_mode, GovernanceMode::Containment);
    }

    #[test]
    fn tampered_incident_fails_verification() {
        let mut ctl = controller();
        assert!(ctl.check_freeze_invalidation("hash_mismatch"));
        let mut incident = ctl.incidents()[0].clone();
        assert_eq!(incident.trigger_value, 1.0);
        assert_eq!(incident.threshold, 0.0);
        incident.trigger_value = 0.5;
        assert!(!ctl.verify_incident(&incident));
    }

    #[test]
    fn model_aging_uses_days() {
        let mut ctl = controller();
        let now = 200 * DAY_MS;
        assert!(!ctl.check_model_aging(now - 90 * DAY_MS, now));
        assert!(ctl.check_model_aging(now - 91 * DAY_MS, now));
        assert_eq!(model_age_days(now, now - DAY_MS), 0.0);
        assert!(model_age_days(u64::MAX, now).is_infinite());
    }

    #[test]
    fn disable_ai_is_logged_and_noop_when_already_human_only() {
        let mut ctl = controller();
        assert!(!ctl.disable_ai("nothing to disable"));
        assert!(ctl.enable_shadow_mode());
        assert!(ctl.disable_ai("operator request"));
        assert_eq!(ctl.current_mode(), GovernanceMode::ModeAOnly);
        let causes: Vec<TransitionCause> = ctl.transitions().iter().map(|t| t.cause).collect();
        assert_eq!(
            causes,
            vec![TransitionCause::ShadowEnabled, TransitionCause::ManualDisable]
        );
    }

    #[test]
    fn signer_from_other_key_rejects_incident() {
        let mut ctl = controller();
        assert!(ctl.check_entropy_collapse(0.5));
        let other = HmacSha256Signer::new(b"other-key").expect("signer");
        let incident = &ctl.incidents()[0];
        assert!(!other.verify(&incident.canonical_bytes(), &incident.signature));
    }

    #[test]
    fn incident_card_renders_rfc3339_and_signature_state() {
        let mut ctl = controller();
        assert!(ctl.check_drift_spike(3.0));
        let card = ctl.incident_card(&ctl.incidents()[0]);
        let text = card.render_plain();
        assert!(text.starts_with("[containment #1::drift_spike]"));
        assert!(text.contains("2023-11-14T22:13:20.000Z"));
        assert!(text.contains("signature verified"));
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ContainmentConfig {
            model_aging_days: -1.0,
            ..ContainmentConfig::default()
        };
        assert!(ContainmentController::with_hmac_key(config, b"k").is_err());
    }

    #[test]
    fn incident_serializes_with_snake_case_enums() {
        let mut ctl = controller();
        assert!(ctl.check_entropy_collapse(0.2));
        let json = serde_json::to_value(&ctl.incidents()[0]).expect("serialize");
        assert_eq!(json["trigger"], "entropy_collapse");
        assert_eq!(json["new_mode"], "containment");
        assert_eq!(json["previous_mode"], "mode_a_only");
    }
}
