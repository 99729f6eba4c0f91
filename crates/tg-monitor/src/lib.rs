#![forbid(unsafe_code)]

//! Rolling statistical monitors for one decision field.
//!
//! Both monitors share the same contract: `record` is O(1) amortized and
//! never fails, evaluation only runs at a count-or-elapsed cadence, `state`
//! returns an owned snapshot, and `reset` returns the monitor to its
//! un-baselined construction state.

mod cadence;
pub mod drift;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_types::{
    DecisionOutcome, OutcomeClass, TypeError, require_positive_count, require_unit_interval,
};
use tg_window::{RollingWindow, WindowError};

pub use cadence::EvalTrigger;
pub use drift::{DriftAction, DriftBaseline, DriftConfig, DriftEvaluation, DriftMonitor, DriftState};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonitorError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("invalid monitor configuration: {0}")]
    Config(#[from] TypeError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionAction {
    #[default]
    None,
    Warning,
    DemoteToTraining,
    EmergencyHalt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub window_capacity: usize,
    pub eval_every: usize,
    pub eval_interval_ms: u64,
    pub min_samples: usize,
    /// Rolling precision below this demotes the field to training.
    pub threshold: f64,
    /// Band above `threshold` that still reports a warning.
    pub warning_margin: f64,
    /// Evaluation-to-evaluation precision drop that latches an emergency halt.
    pub rapid_drop_threshold: f64,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            window_capacity: 1_000,
            eval_every: 50,
            eval_interval_ms: 300_000,
            min_samples: 50,
            threshold: 0.95,
            warning_margin: 0.02,
            rapid_drop_threshold: 0.25,
        }
    }
}

impl PrecisionConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_positive_count("precision.window_capacity", self.window_capacity)?;
        require_positive_count("precision.eval_every", self.eval_every)?;
        require_positive_count("precision.min_samples", self.min_samples)?;
        require_unit_interval("precision.threshold", self.threshold)?;
        require_unit_interval("precision.warning_margin", self.warning_margin)?;
        require_unit_interval("precision.rapid_drop_threshold", self.rapid_drop_threshold)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
}

impl ConfusionCounts {
    fn slot(&mut self, class: OutcomeClass) -> &mut u64 {
        match class {
            OutcomeClass::TruePositive => &mut self.tp,
            OutcomeClass::FalsePositive => &mut self.fp,
            OutcomeClass::TrueNegative => &mut self.tn,
            OutcomeClass::FalseNegative => &mut self.fn_,
        }
    }

    fn add(&mut self, class: OutcomeClass) {
        *self.slot(class) += 1;
    }

    fn remove(&mut self, class: OutcomeClass) {
        let slot = self.slot(class);
        *slot = slot.saturating_sub(1);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.tp + self.fp + self.tn + self.fn_
    }

    /// `TP / (TP + FP)`, zero before any positive prediction.
    #[must_use]
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// `TP / (TP + FN)`, zero before any actual positive.
    #[must_use]
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    #[must_use]
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a DecisionOutcome>) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            counts.add(outcome.class());
        }
        counts
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionEvaluation {
    pub trigger: EvalTrigger,
    pub action: PrecisionAction,
    pub rolling_precision: f64,
    pub previous_precision: Option<f64>,
    /// `previous - current`; absent on the first sufficient evaluation.
    pub drop: Option<f64>,
    /// Drop that latched the emergency halt. Repeated on every evaluation
    /// until `reset`.
    pub latched_drop: Option<f64>,
    pub window_len: usize,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionState {
    pub counts: ConfusionCounts,
    pub window_len: usize,
    pub window_capacity: usize,
    pub rolling_precision: f64,
    pub rolling_recall: f64,
    pub total_recorded: u64,
    pub decisions_since_eval: usize,
    pub evaluations: u64,
    pub previous_precision: Option<f64>,
    pub last_action: PrecisionAction,
    pub demotion_triggered: bool,
    pub rapid_drop_detected: bool,
    pub latched_drop: Option<f64>,
    pub time_trigger_enabled: bool,
}

/// Persisted slice of the precision monitor. Counts are informational; only
/// `previous_precision` seeds behavior after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionBaseline {
    pub rolling_precision: f64,
    pub previous_precision: Option<f64>,
    pub window_len: usize,
    #[serde(flatten)]
    pub counts: ConfusionCounts,
}

#[derive(Debug, Clone)]
pub struct PrecisionMonitor {
    config: PrecisionConfig,
    window: RollingWindow<DecisionOutcome>,
    counts: ConfusionCounts,
    cadence: cadence::EvalCadence,
    total_recorded: u64,
    evaluations: u64,
    previous_precision: Option<f64>,
    last_action: PrecisionAction,
    latched_drop: Option<f64>,
}

impl PrecisionMonitor {
    pub fn new(config: PrecisionConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self {
            window: RollingWindow::new(config.window_capacity)?,
            cadence: cadence::EvalCadence::new(config.eval_every, config.eval_interval_ms),
            counts: ConfusionCounts::default(),
            total_recorded: 0,
            evaluations: 0,
            previous_precision: None,
            last_action: PrecisionAction::None,
            latched_drop: None,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PrecisionConfig {
        &self.config
    }

    /// Record one labelled outcome. Returns the evaluation when the cadence
    /// fired on this record.
    pub fn record(&mut self, outcome: DecisionOutcome) -> Option<PrecisionEvaluation> {
        let class = outcome.class();
        if let Some(evicted) = self.window.push(outcome) {
            self.counts.remove(evicted.class());
        }
        self.counts.add(class);
        self.total_recorded += 1;

        let trigger = self.cadence.observe(outcome.timestamp_ms)?;
        Some(self.evaluate(trigger))
    }

    /// Evaluate now regardless of cadence (shutdown, certification).
    pub fn force_evaluate(&mut self) -> PrecisionEvaluation {
        self.evaluate(EvalTrigger::Forced)
    }

    fn evaluate(&mut self, trigger: EvalTrigger) -> PrecisionEvaluation {
        self.cadence.mark_evaluated();
        self.evaluations += 1;

        let rolling_precision = self.counts.precision();
        let window_len = self.window.len();
        let previous_precision = self.previous_precision;

        if window_len < self.config.min_samples {
            self.last_action = PrecisionAction::None;
            return PrecisionEvaluation {
                trigger,
                action: PrecisionAction::None,
                rolling_precision,
                previous_precision,
                drop: None,
                latched_drop: self.latched_drop,
                window_len,
                insufficient_data: true,
            };
        }

        let drop = previous_precision.map(|previous| previous - rolling_precision);
        let action = if self.latched_drop.is_some() {
            PrecisionAction::EmergencyHalt
        } else if drop.is_some_and(|d| d > self.config.rapid_drop_threshold) {
            self.latched_drop = drop;
            #[cfg(feature = "tracing")]
            tracing::error!(
                rolling_precision,
                previous = ?previous_precision,
                "precision collapsed between evaluations; emergency halt latched"
            );
            PrecisionAction::EmergencyHalt
        } else if rolling_precision < self.config.threshold {
            PrecisionAction::DemoteToTraining
        } else if rolling_precision < self.config.threshold + self.config.warning_margin {
            PrecisionAction::Warning
        } else {
            PrecisionAction::None
        };

        self.previous_precision = Some(rolling_precision);
        self.last_action = action;

        PrecisionEvaluation {
            trigger,
            action,
            rolling_precision,
            previous_precision,
            drop,
            latched_drop: self.latched_drop,
            window_len,
            insufficient_data: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> PrecisionState {
        PrecisionState {
            counts: self.counts,
            window_len: self.window.len(),
            window_capacity: self.window.capacity(),
            rolling_precision: self.counts.precision(),
            rolling_recall: self.counts.recall(),
            total_recorded: self.total_recorded,
            decisions_since_eval: self.cadence.since_eval(),
            evaluations: self.evaluations,
            previous_precision: self.previous_precision,
            last_action: self.last_action,
            demotion_triggered: matches!(
                self.last_action,
                PrecisionAction::DemoteToTraining | PrecisionAction::EmergencyHalt
            ),
            rapid_drop_detected: self.latched_drop.is_some(),
            latched_drop: self.latched_drop,
            time_trigger_enabled: self.cadence.time_trigger_enabled(),
        }
    }

    /// Recount the window from scratch. Always equals the incrementally
    /// maintained counts.
    #[must_use]
    pub fn recount(&self) -> ConfusionCounts {
        ConfusionCounts::from_outcomes(self.window.iter())
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.counts = ConfusionCounts::default();
        self.cadence.reset();
        self.total_recorded = 0;
        self.evaluations = 0;
        self.previous_precision = None;
        self.last_action = PrecisionAction::None;
        self.latched_drop = None;
    }

    #[must_use]
    pub fn baseline(&self) -> PrecisionBaseline {
        PrecisionBaseline {
            rolling_precision: self.counts.precision(),
            previous_precision: self.previous_precision,
            window_len: self.window.len(),
            counts: self.counts,
        }
    }

    /// Re-seed the evaluation baseline after a restart. The window itself is
    /// not restored; it refills from live traffic.
    pub fn restore(&mut self, baseline: &PrecisionBaseline) {
        self.previous_precision = baseline
            .previous_precision
            .filter(|value| value.is_finite());
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tg_types::DecisionOutcome;

    use super::{PrecisionAction, PrecisionConfig, PrecisionMonitor};

    fn tp(ts: u64) -> DecisionOutcome {
        DecisionOutcome::new(true, true, 0.97, ts)
    }

    fn fp(ts: u64) -> DecisionOutcome {
        DecisionOutcome::new(true, false, 0.96, ts)
    }

    fn monitor() -> PrecisionMonitor {
        PrecisionMonitor::new(PrecisionConfig::default()).expect("monitor")
    }

    #[test]
    fn eighty_tp_twenty_fp_demotes_to_training() {
        let mut monitor = monitor();
        for i in 0..80 {
            monitor.record(tp(1_000 + i));
        }
        for i in 0..20 {
            monitor.record(fp(2_000 + i));
        }
        let state = monitor.state();
        assert!((state.rolling_precision - 0.80).abs() < 1e-12);
        assert!(state.demotion_triggered);
        assert_eq!(state.last_action, PrecisionAction::DemoteToTraining);
        assert!(!state.rapid_drop_detected);
    }

    #[test]
    fn collapse_after_clean_baseline_latches_emergency_halt() {
        let mut monitor = monitor();
        for i in 0..55 {
            monitor.record(tp(1_000 + i));
        }
        for i in 0..50 {
            monitor.record(fp(2_000 + i));
        }
        let state = monitor.state();
        assert!(state.rapid_drop_detected);
        assert_eq!(state.last_action, PrecisionAction::EmergencyHalt);
        let latched = state.latched_drop.expect("latched drop");
        assert!((latched - 0.45).abs() < 1e-12);

        // Recovery traffic never downgrades the sticky halt, and every
        // later evaluation repeats the drop that latched it.
        let mut last = None;
        for i in 0..500 {
            last = monitor.record(tp(3_000 + i)).or(last);
        }
        let last = last.expect("evaluated");
        assert_eq!(last.action, PrecisionAction::EmergencyHalt);
        assert_eq!(last.latched_drop, Some(latched));
        assert!(last.drop.is_some_and(|d| d <= 0.25));
        let state = monitor.state();
        assert!(state.rolling_precision > 0.9);
        assert_eq!(state.last_action, PrecisionAction::EmergencyHalt);

        monitor.reset();
        let state = monitor.state();
        assert!(!state.rapid_drop_detected);
        assert_eq!(state.latched_drop, None);
        assert_eq!(state.window_len, 0);
        assert_eq!(state.last_action, PrecisionAction::None);
    }

    #[test]
    fn evaluation_only_runs_at_cadence() {
        let mut monitor = monitor();
        for i in 0..49 {
            assert!(monitor.record(tp(1_000 + i)).is_none());
        }
        let evaluation = monitor.record(tp(1_049)).expect("50th record evaluates");
        assert_eq!(evaluation.action, PrecisionAction::None);
        assert_eq!(evaluation.previous_precision, None);
        assert_eq!(monitor.state().evaluations, 1);
    }

    #[test]
    fn insufficient_window_reports_none_even_when_time_elapses() {
        let mut monitor = monitor();
        monitor.record(fp(1_000));
        let evaluation = monitor
            .record(fp(1_000 + 300_000))
            .expect("elapsed trigger fires");
        assert!(evaluation.insufficient_data);
        assert_eq!(evaluation.action, PrecisionAction::None);
        assert_eq!(monitor.state().previous_precision, None);
    }

    #[test]
    fn warning_band_sits_just_above_threshold() {
        let mut monitor = monitor();
        // 48 TP + 2 FP = 0.96, inside [0.95, 0.97).
        for i in 0..48 {
            monitor.record(tp(1 + i));
        }
        monitor.record(fp(100));
        let evaluation = monitor.record(fp(101)).expect("evaluates");
        assert!((evaluation.rolling_precision - 0.96).abs() < 1e-12);
        assert_eq!(evaluation.action, PrecisionAction::Warning);
    }

    #[test]
    fn zero_timestamps_keep_count_cadence_alive() {
        let mut monitor = monitor();
        for _ in 0..49 {
            monitor.record(tp(0));
        }
        assert!(!monitor.state().time_trigger_enabled);
        assert!(monitor.record(tp(0)).is_some());
    }

    #[test]
    fn state_is_idempotent_between_records() {
        let mut monitor = monitor();
        for i in 0..120 {
            monitor.record(if i % 7 == 0 { fp(i + 1) } else { tp(i + 1) });
        }
        assert_eq!(monitor.state(), monitor.state());
    }

    #[test]
    fn restored_baseline_drives_the_next_drop_check() {
        let mut monitor = monitor();
        monitor.restore(&super::PrecisionBaseline {
            previous_precision: Some(0.99),
            ..super::PrecisionBaseline::default()
        });
        for i in 0..30 {
            monitor.record(tp(1 + i));
        }
        for i in 0..19 {
            monitor.record(fp(100 + i));
        }
        let evaluation = monitor.record(fp(200)).expect("evaluates");
        assert_eq!(evaluation.action, PrecisionAction::EmergencyHalt);
    }

    #[test]
    fn baseline_serializes_flat_counts() {
        let mut monitor = monitor();
        monitor.record(tp(1));
        monitor.record(fp(2));
        let json = serde_json::to_value(monitor.baseline()).expect("serialize");
        assert_eq!(json["tp"], 1);
        assert_eq!(json["fp"], 1);
        assert_eq!(json["fn"], 0);
    }

    proptest! {
        #[test]
        fn incremental_counts_match_a_full_recount(pattern in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..600)) {
            let config = PrecisionConfig { window_capacity: 128, ..PrecisionConfig::default() };
            let mut monitor = PrecisionMonitor::new(config).expect("monitor");
            for (idx, (predicted, actual)) in pattern.iter().enumerate() {
                monitor.record(DecisionOutcome::new(*predicted, *actual, 0.5, idx as u64 + 1));
            }
            prop_assert_eq!(monitor.state().counts, monitor.recount());
            prop_assert!(monitor.state().window_len <= 128);
        }

        #[test]
        fn precision_converges_to_one_minus_fp_rate(p in 0.0f64..0.5) {
            let capacity = 400usize;
            let config = PrecisionConfig { window_capacity: capacity, ..PrecisionConfig::default() };
            let mut monitor = PrecisionMonitor::new(config).expect("monitor");
            // Evenly spread false positives at rate p, all predictions positive.
            for i in 0..(3 * capacity) {
                let is_fp = ((i + 1) as f64 * p).floor() > (i as f64 * p).floor();
                monitor.record(DecisionOutcome::new(true, !is_fp, 0.9, i as u64 + 1));
            }
            let precision = monitor.state().rolling_precision;
            prop_assert!((precision - (1.0 - p)).abs() <= 2.0 / capacity as f64, "precision={} p={}", precision, p);
        }
    }
}
