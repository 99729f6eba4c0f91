#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use tg_types::{FieldId, TypeError, UnixMillis, now_unix_ms, require_non_negative};

/// Metrics and identity of a model at certification time. Read-only once
/// stored; a breach invalidates it rather than deleting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeSnapshot {
    pub field_id: FieldId,
    /// Hex digest of the certified weights.
    pub weight_hash: String,
    pub precision_at_freeze: f64,
    pub ece_at_freeze: f64,
    pub kl_baseline: f64,
    pub feature_dims: u32,
    pub frozen_at_ms: UnixMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeConfig {
    pub max_precision_drop: f64,
    pub kl_floor: f64,
    pub kl_multiplier: f64,
    pub max_ece_increase: f64,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            max_precision_drop: 0.02,
            kl_floor: 0.45,
            kl_multiplier: 2.0,
            max_ece_increase: 0.02,
        }
    }
}

impl FreezeConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_non_negative("max_precision_drop", self.max_precision_drop)?;
        require_non_negative("kl_floor", self.kl_floor)?;
        require_non_negative("kl_multiplier", self.kl_multiplier)?;
        require_non_negative("max_ece_increase", self.max_ece_increase)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    PrecisionBreach,
    KlDriftBreach,
    EceCalibrationBreach,
    HashMismatch,
    DimensionChange,
    ManualRevocation,
}

impl InvalidationReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrecisionBreach => "precision_breach",
            Self::KlDriftBreach => "kl_drift_breach",
            Self::EceCalibrationBreach => "ece_calibration_breach",
            Self::HashMismatch => "hash_mismatch",
            Self::DimensionChange => "dimension_change",
            Self::ManualRevocation => "manual_revocation",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreachEvidence {
    Metric { observed: f64, limit: f64 },
    Hash { expected: String, observed: String },
    Dimensions { expected: u32, observed: u32 },
    Manual { note: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub sequence: u64,
    pub field_id: FieldId,
    pub reason: InvalidationReason,
    pub evidence: BreachEvidence,
    pub at_ms: UnixMillis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FreezeCheck {
    Held,
    Breached(InvalidationEvent),
    NoSnapshot,
}

impl FreezeCheck {
    #[must_use]
    pub fn is_breach(&self) -> bool {
        matches!(self, Self::Breached(_))
    }
}

/// Guards a certified snapshot against live-metric regressions.
///
/// Every check is independent. Any breach clears `freeze_valid` until the
/// next [`FreezeInvalidator::set_snapshot`]; the event log spans snapshots
/// and is never cleared.
#[derive(Debug, Clone)]
pub struct FreezeInvalidator {
    config: FreezeConfig,
    snapshot: Option<FreezeSnapshot>,
    freeze_valid: bool,
    events: Vec<InvalidationEvent>,
    clock: fn() -> UnixMillis,
}

impl FreezeInvalidator {
    pub fn new(config: FreezeConfig) -> Result<Self, TypeError> {
        config.validate()?;
        Ok(Self {
            config,
            snapshot: None,
            freeze_valid: false,
            events: Vec::new(),
            clock: now_unix_ms,
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> UnixMillis) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_snapshot(&mut self, snapshot: FreezeSnapshot) {
        self.snapshot = Some(snapshot);
        self.freeze_valid = true;
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&FreezeSnapshot> {
        self.snapshot.as_ref()
    }

    /// False without a snapshot.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.snapshot.is_some() && self.freeze_valid
    }

    #[must_use]
    pub fn events(&self) -> &[InvalidationEvent] {
        &self.events
    }

    pub fn check_precision(&mut self, live_precision: f64) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        let drop = snapshot.precision_at_freeze - live_precision;
        if drop <= self.config.max_precision_drop {
            return FreezeCheck::Held;
        }
        let limit = snapshot.precision_at_freeze - self.config.max_precision_drop;
        self.invalidate(
            InvalidationReason::PrecisionBreach,
            BreachEvidence::Metric {
                observed: live_precision,
                limit,
            },
        )
    }

    pub fn check_kl_drift(&mut self, live_kl: f64) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        let limit = self
            .config
            .kl_floor
            .max(snapshot.kl_baseline * self.config.kl_multiplier);
        if live_kl <= limit {
            return FreezeCheck::Held;
        }
        self.invalidate(
            InvalidationReason::KlDriftBreach,
            BreachEvidence::Metric {
                observed: live_kl,
                limit,
            },
        )
    }

    pub fn check_ece(&mut self, live_ece: f64) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        if live_ece - snapshot.ece_at_freeze <= self.config.max_ece_increase {
            return FreezeCheck::Held;
        }
        let limit = snapshot.ece_at_freeze + self.config.max_ece_increase;
        self.invalidate(
            InvalidationReason::EceCalibrationBreach,
            BreachEvidence::Metric {
                observed: live_ece,
                limit,
            },
        )
    }

    pub fn check_hash(&mut self, live_hash: &str) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        if snapshot.weight_hash.as_bytes() == live_hash.as_bytes() {
            return FreezeCheck::Held;
        }
        let expected = snapshot.weight_hash.clone();
        self.invalidate(
            InvalidationReason::HashMismatch,
            BreachEvidence::Hash {
                expected,
                observed: live_hash.to_owned(),
            },
        )
    }

    pub fn check_dimensions(&mut self, live_dims: u32) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        if snapshot.feature_dims == live_dims {
            return FreezeCheck::Held;
        }
        let expected = snapshot.feature_dims;
        self.invalidate(
            InvalidationReason::DimensionChange,
            BreachEvidence::Dimensions {
                expected,
                observed: live_dims,
            },
        )
    }

    pub fn revoke(&mut self, note: impl Into<String>) -> FreezeCheck {
        if self.snapshot.is_none() {
            return FreezeCheck::NoSnapshot;
        }
        self.invalidate(
            InvalidationReason::ManualRevocation,
            BreachEvidence::Manual { note: note.into() },
        )
    }

    fn invalidate(
        &mut self,
        reason: InvalidationReason,
        evidence: BreachEvidence,
    ) -> FreezeCheck {
        let Some(snapshot) = &self.snapshot else {
            return FreezeCheck::NoSnapshot;
        };
        let event = InvalidationEvent {
            sequence: self.events.len() as u64 + 1,
            field_id: snapshot.field_id.clone(),
            reason,
            evidence,
            at_ms: (self.clock)(),
        };
        #[cfg(feature = "tracing")]
        tracing::warn!(
            field = %event.field_id,
            reason = %reason,
            sequence = event.sequence,
            "freeze snapshot invalidated"
        );
        self.freeze_valid = false;
        self.events.push(event.clone());
        FreezeCheck::Breached(event)
    }
}
