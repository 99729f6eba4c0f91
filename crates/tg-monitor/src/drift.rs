//! Confidence/entropy drift and duplicate-risk monitoring.
//!
//! Drift is scored with a KL-style proxy over window means relative to a
//! baseline, and alarmed against thresholds that scale with an EMA of the
//! score itself (with absolute floors so a zero baseline cannot collapse the
//! threshold). Duplicate-risk spikes tighten the decision gate through two
//! additive knobs that decay once the spike subsides.

use serde::{Deserialize, Serialize};
use tg_types::{
    DriftSample, GateAdjustments, TypeError, mean, population_variance, require_finite,
    require_non_negative, require_positive_count, require_unit_interval, sanitize_unit,
};
use tg_window::RollingWindow;

use crate::MonitorError;
use crate::cadence::{EvalCadence, EvalTrigger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftAction {
    #[default]
    None,
    Warning,
    Containment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub window_capacity: usize,
    pub eval_every: usize,
    pub eval_interval_ms: u64,
    pub min_samples: usize,
    pub kl_ema_alpha: f64,
    pub warn_floor: f64,
    pub warn_multiplier: f64,
    pub contain_floor: f64,
    pub contain_multiplier: f64,
    /// Lower clamp applied to both sides of a ratio before taking its log.
    pub ratio_floor: f64,
    /// Window confidence std-dev at or below this counts as zero spread, so
    /// rounding noise in a constant window cannot read as a sigma shift.
    pub min_confidence_std: f64,
    pub duplicate_risk_cutoff: f64,
    pub duplicate_fraction_limit: f64,
    pub confidence_adj_step: f64,
    pub confidence_adj_cap: f64,
    pub abstention_adj_step: f64,
    pub abstention_adj_cap: f64,
    pub adj_decay: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_capacity: 500,
            eval_every: 50,
            eval_interval_ms: 300_000,
            min_samples: 50,
            kl_ema_alpha: 0.05,
            warn_floor: 0.35,
            warn_multiplier: 1.5,
            contain_floor: 0.45,
            contain_multiplier: 2.0,
            ratio_floor: 1e-6,
            min_confidence_std: 1e-6,
            duplicate_risk_cutoff: 60.0,
            duplicate_fraction_limit: 0.20,
            confidence_adj_step: 0.02,
            confidence_adj_cap: 0.10,
            abstention_adj_step: 0.03,
            abstention_adj_cap: 0.15,
            adj_decay: 0.005,
        }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<(), TypeError> {
        require_positive_count("drift.window_capacity", self.window_capacity)?;
        require_positive_count("drift.eval_every", self.eval_every)?;
        require_positive_count("drift.min_samples", self.min_samples)?;
        require_unit_interval("drift.kl_ema_alpha", self.kl_ema_alpha)?;
        require_non_negative("drift.warn_floor", self.warn_floor)?;
        require_non_negative("drift.warn_multiplier", self.warn_multiplier)?;
        require_non_negative("drift.contain_floor", self.contain_floor)?;
        require_non_negative("drift.contain_multiplier", self.contain_multiplier)?;
        if self.ratio_floor <= 0.0 || !self.ratio_floor.is_finite() {
            return Err(TypeError::NonPositive {
                field: "drift.ratio_floor",
            });
        }
        require_non_negative("drift.min_confidence_std", self.min_confidence_std)?;
        require_finite("drift.duplicate_risk_cutoff", self.duplicate_risk_cutoff)?;
        require_unit_interval("drift.duplicate_fraction_limit", self.duplicate_fraction_limit)?;
        require_unit_interval("drift.confidence_adj_step", self.confidence_adj_step)?;
        require_unit_interval("drift.confidence_adj_cap", self.confidence_adj_cap)?;
        require_unit_interval("drift.abstention_adj_step", self.abstention_adj_step)?;
        require_unit_interval("drift.abstention_adj_cap", self.abstention_adj_cap)?;
        require_unit_interval("drift.adj_decay", self.adj_decay)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvaluation {
    pub trigger: EvalTrigger,
    pub action: DriftAction,
    pub review_alert: bool,
    pub insufficient_data: bool,
    pub window_len: usize,
    pub mean_confidence: f64,
    pub mean_entropy: f64,
    pub confidence_baseline: f64,
    pub entropy_baseline: f64,
    pub confidence_inflation: f64,
    pub entropy_shift: f64,
    /// Fractional entropy loss relative to baseline, zero when entropy rose.
    pub entropy_collapse: f64,
    /// `|mean - baseline|` in units of the window's confidence std-dev.
    pub confidence_shift_sigma: f64,
    pub kl: f64,
    /// EMA after folding in `kl`.
    pub kl_ema: f64,
    pub warn_threshold: f64,
    pub contain_threshold: f64,
    pub duplicate_fraction: f64,
    pub adjustments: GateAdjustments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftState {
    pub window_len: usize,
    pub window_capacity: usize,
    pub total_recorded: u64,
    pub samples_since_eval: usize,
    pub evaluations: u64,
    pub confidence_baseline: Option<f64>,
    pub entropy_baseline: Option<f64>,
    pub kl_baseline_ema: Option<f64>,
    pub duplicate_cluster_baseline: Option<f64>,
    pub adjustments: GateAdjustments,
    pub last_action: DriftAction,
    pub review_alert: bool,
    pub last_evaluation: Option<DriftEvaluation>,
    pub time_trigger_enabled: bool,
}

/// The incremental part of the drift monitor that must survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftBaseline {
    pub kl_baseline_ema: Option<f64>,
    pub entropy_baseline: Option<f64>,
    pub confidence_baseline: Option<f64>,
    pub duplicate_cluster_baseline: Option<f64>,
    #[serde(flatten)]
    pub adjustments: GateAdjustments,
}

#[derive(Debug, Clone)]
pub struct DriftMonitor {
    config: DriftConfig,
    window: RollingWindow<DriftSample>,
    cadence: EvalCadence,
    total_recorded: u64,
    evaluations: u64,
    confidence_baseline: Option<f64>,
    entropy_baseline: Option<f64>,
    kl_ema: Option<f64>,
    duplicate_ema: Option<f64>,
    adjustments: GateAdjustments,
    last_action: DriftAction,
    review_alert: bool,
    last_evaluation: Option<DriftEvaluation>,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self {
            window: RollingWindow::new(config.window_capacity)?,
            cadence: EvalCadence::new(config.eval_every, config.eval_interval_ms),
            total_recorded: 0,
            evaluations: 0,
            confidence_baseline: None,
            entropy_baseline: None,
            kl_ema: None,
            duplicate_ema: None,
            adjustments: GateAdjustments::default(),
            last_action: DriftAction::None,
            review_alert: false,
            last_evaluation: None,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Pin the reference distribution (typically from certification data).
    pub fn set_baseline(&mut self, confidence: f64, entropy: f64) {
        self.confidence_baseline = Some(confidence);
        self.entropy_baseline = Some(entropy);
    }

    pub fn record(&mut self, sample: DriftSample) -> Option<DriftEvaluation> {
        self.window.push(sanitize(sample));
        self.total_recorded += 1;
        let trigger = self.cadence.observe(sample.timestamp_ms)?;
        Some(self.evaluate(trigger))
    }

    pub fn force_evaluate(&mut self) -> DriftEvaluation {
        self.evaluate(EvalTrigger::Forced)
    }

    fn evaluate(&mut self, trigger: EvalTrigger) -> DriftEvaluation {
        self.cadence.mark_evaluated();
        self.evaluations += 1;

        let confidences: Vec<f64> = self.window.iter().map(|s| s.confidence).collect();
        let entropies: Vec<f64> = self.window.iter().map(|s| s.feature_entropy).collect();
        let mean_confidence = mean(&confidences).unwrap_or(0.0);
        let mean_entropy = mean(&entropies).unwrap_or(0.0);
        let window_len = self.window.len();

        if window_len < self.config.min_samples {
            let evaluation = self.insufficient(trigger, window_len, mean_confidence, mean_entropy);
            self.last_action = DriftAction::None;
            self.last_evaluation = Some(evaluation.clone());
            return evaluation;
        }

        let confidence_baseline = *self.confidence_baseline.get_or_insert(mean_confidence);
        let entropy_baseline = *self.entropy_baseline.get_or_insert(mean_entropy);

        let confidence_inflation = mean_confidence - confidence_baseline;
        let entropy_shift = mean_entropy - entropy_baseline;
        let entropy_collapse = if entropy_baseline > 0.0 {
            ((entropy_baseline - mean_entropy) / entropy_baseline).max(0.0)
        } else {
            0.0
        };
        let std_confidence = population_variance(&confidences)
            .unwrap_or(0.0)
            .sqrt();
        let confidence_shift_sigma = if std_confidence > self.config.min_confidence_std {
            confidence_inflation.abs() / std_confidence
        } else {
            0.0
        };

        let r_c = self.clamped_ratio(mean_confidence, confidence_baseline);
        let r_e = self.clamped_ratio(mean_entropy, entropy_baseline);
        let kl = (r_c * r_c.ln()).abs() + (r_e * r_e.ln()).abs();

        // Thresholds come from the EMA before this evaluation is folded in so
        // a spike cannot raise its own bar.
        let (warn_threshold, contain_threshold) = match self.kl_ema {
            Some(ema) => (
                self.config.warn_floor.max(ema * self.config.warn_multiplier),
                self.config.contain_floor.max(ema * self.config.contain_multiplier),
            ),
            None => (self.config.warn_floor, self.config.contain_floor),
        };
        let kl_ema = match self.kl_ema {
            Some(ema) => self.config.kl_ema_alpha * kl + (1.0 - self.config.kl_ema_alpha) * ema,
            None => kl,
        };
        self.kl_ema = Some(kl_ema);

        let action = if kl > contain_threshold {
            DriftAction::Containment
        } else if kl > warn_threshold {
            DriftAction::Warning
        } else {
            DriftAction::None
        };

        let duplicate_fraction = self
            .window
            .iter()
            .filter(|s| s.duplicate_risk_score >= self.config.duplicate_risk_cutoff)
            .count() as f64
            / window_len as f64;
        self.duplicate_ema = Some(match self.duplicate_ema {
            Some(ema) => {
                self.config.kl_ema_alpha * duplicate_fraction
                    + (1.0 - self.config.kl_ema_alpha) * ema
            }
            None => duplicate_fraction,
        });
        let review_alert = duplicate_fraction > self.config.duplicate_fraction_limit;
        self.adjust_gate(review_alert);

        #[cfg(feature = "tracing")]
        if review_alert {
            tracing::warn!(
                duplicate_fraction,
                confidence_threshold_adj = self.adjustments.confidence_threshold_adj,
                abstention_band_adj = self.adjustments.abstention_band_adj,
                "duplicate-risk spike; tightening decision gate"
            );
        }

        self.last_action = action;
        self.review_alert = review_alert;

        let evaluation = DriftEvaluation {
            trigger,
            action,
            review_alert,
            insufficient_data: false,
            window_len,
            mean_confidence,
            mean_entropy,
            confidence_baseline,
            entropy_baseline,
            confidence_inflation,
            entropy_shift,
            entropy_collapse,
            confidence_shift_sigma,
            kl,
            kl_ema,
            warn_threshold,
            contain_threshold,
            duplicate_fraction,
            adjustments: self.adjustments,
        };
        self.last_evaluation = Some(evaluation.clone());
        evaluation
    }

    fn insufficient(
        &self,
        trigger: EvalTrigger,
        window_len: usize,
        mean_confidence: f64,
        mean_entropy: f64,
    ) -> DriftEvaluation {
        DriftEvaluation {
            trigger,
            action: DriftAction::None,
            review_alert: false,
            insufficient_data: true,
            window_len,
            mean_confidence,
            mean_entropy,
            confidence_baseline: self.confidence_baseline.unwrap_or(mean_confidence),
            entropy_baseline: self.entropy_baseline.unwrap_or(mean_entropy),
            confidence_inflation: 0.0,
            entropy_shift: 0.0,
            entropy_collapse: 0.0,
            confidence_shift_sigma: 0.0,
            kl: 0.0,
            kl_ema: self.kl_ema.unwrap_or(0.0),
            warn_threshold: self.config.warn_floor,
            contain_threshold: self.config.contain_floor,
            duplicate_fraction: 0.0,
            adjustments: self.adjustments,
        }
    }

    fn clamped_ratio(&self, value: f64, baseline: f64) -> f64 {
        value.max(self.config.ratio_floor) / baseline.max(self.config.ratio_floor)
    }

    fn adjust_gate(&mut self, spike: bool) {
        let adj = &mut self.adjustments;
        if spike {
            adj.confidence_threshold_adj = (adj.confidence_threshold_adj
                + self.config.confidence_adj_step)
                .min(self.config.confidence_adj_cap);
            adj.abstention_band_adj = (adj.abstention_band_adj + self.config.abstention_adj_step)
                .min(self.config.abstention_adj_cap);
        } else {
            adj.confidence_threshold_adj =
                (adj.confidence_threshold_adj - self.config.adj_decay).max(0.0);
            adj.abstention_band_adj = (adj.abstention_band_adj - self.config.adj_decay).max(0.0);
        }
    }

    #[must_use]
    pub fn adjustments(&self) -> GateAdjustments {
        self.adjustments
    }

    #[must_use]
    pub fn state(&self) -> DriftState {
        DriftState {
            window_len: self.window.len(),
            window_capacity: self.window.capacity(),
            total_recorded: self.total_recorded,
            samples_since_eval: self.cadence.since_eval(),
            evaluations: self.evaluations,
            confidence_baseline: self.confidence_baseline,
            entropy_baseline: self.entropy_baseline,
            kl_baseline_ema: self.kl_ema,
            duplicate_cluster_baseline: self.duplicate_ema,
            adjustments: self.adjustments,
            last_action: self.last_action,
            review_alert: self.review_alert,
            last_evaluation: self.last_evaluation.clone(),
            time_trigger_enabled: self.cadence.time_trigger_enabled(),
        }
    }

    /// Clears the window and every baseline; the next sufficient evaluation
    /// re-seeds from live traffic.
    pub fn reset(&mut self) {
        self.window.clear();
        self.cadence.reset();
        self.total_recorded = 0;
        self.evaluations = 0;
        self.confidence_baseline = None;
        self.entropy_baseline = None;
        self.kl_ema = None;
        self.duplicate_ema = None;
        self.adjustments = GateAdjustments::default();
        self.last_action = DriftAction::None;
        self.review_alert = false;
        self.last_evaluation = None;
    }

    #[must_use]
    pub fn baseline(&self) -> DriftBaseline {
        DriftBaseline {
            kl_baseline_ema: self.kl_ema,
            entropy_baseline: self.entropy_baseline,
            confidence_baseline: self.confidence_baseline,
            duplicate_cluster_baseline: self.duplicate_ema,
            adjustments: self.adjustments,
        }
    }

    /// Non-finite persisted values are dropped rather than trusted.
    pub fn restore(&mut self, baseline: &DriftBaseline) {
        let finite = |value: Option<f64>| value.filter(|v| v.is_finite());
        self.kl_ema = finite(baseline.kl_baseline_ema);
        self.entropy_baseline = finite(baseline.entropy_baseline);
        self.confidence_baseline = finite(baseline.confidence_baseline);
        self.duplicate_ema = finite(baseline.duplicate_cluster_baseline);
        self.adjustments = GateAdjustments {
            confidence_threshold_adj: sanitize_unit(
                baseline.adjustments.confidence_threshold_adj,
                self.config.confidence_adj_cap,
            )
            .min(self.config.confidence_adj_cap),
            abstention_band_adj: sanitize_unit(
                baseline.adjustments.abstention_band_adj,
                self.config.abstention_adj_cap,
            )
            .min(self.config.abstention_adj_cap),
        };
    }
}

/// Garbage input is mapped to the value that looks most alarming: inflated
/// confidence, collapsed entropy, maximal duplicate risk.
fn sanitize(sample: DriftSample) -> DriftSample {
    DriftSample {
        confidence: sanitize_unit(sample.confidence, 1.0),
        feature_entropy: if sample.feature_entropy.is_finite() {
            sample.feature_entropy.max(0.0)
        } else {
            0.0
        },
        duplicate_risk_score: if sample.duplicate_risk_score.is_finite() {
            sample.duplicate_risk_score
        } else {
            100.0
        },
        timestamp_ms: sample.timestamp_ms,
    }
}

#[cfg(test)]
mod tests {
    use tg_types::DriftSample;

    use super::{DriftAction, DriftBaseline, DriftConfig, DriftMonitor};

    fn monitor() -> DriftMonitor {
        DriftMonitor::new(DriftConfig::default()).expect("monitor")
    }

    fn feed(monitor: &mut DriftMonitor, n: usize, confidence: f64, entropy: f64, dup: f64) {
        for i in 0..n {
            monitor.record(DriftSample::new(confidence, entropy, dup, 1 + i as u64));
        }
    }

    #[test]
    fn constant_confidence_reports_no_sigma_shift() {
        for confidence in [0.6, 0.7, 0.77, 0.9, 0.93, 0.97, 0.99] {
            let mut monitor = monitor();
            feed(&mut monitor, 350, confidence, 2.0, 10.0);
            feed(&mut monitor, 50, confidence, 2.0, 10.0);
            let evaluation = monitor.force_evaluate();
            assert_eq!(evaluation.confidence_shift_sigma, 0.0, "confidence {confidence}");
            assert!(evaluation.confidence_inflation.abs() < 1e-9);
        }
    }

    #[test]
    fn mixed_window_reports_shift_in_sigma_units() {
        let mut monitor = monitor();
        feed(&mut monitor, 100, 0.9, 2.0, 10.0);
        feed(&mut monitor, 100, 0.7, 2.0, 10.0);
        let evaluation = monitor.force_evaluate();
        // Baseline 0.9; window of 200 split evenly between 0.9 and 0.7.
        assert!((evaluation.confidence_inflation + 0.1).abs() < 1e-9);
        assert!((evaluation.confidence_shift_sigma - 1.0).abs() < 1e-9);
    }

    #[test]
    fn first_sufficient_evaluation_seeds_baselines_without_alarm() {
        let mut monitor = monitor();
        feed(&mut monitor, 50, 0.8, 2.0, 10.0);
        let state = monitor.state();
        let confidence_baseline = state.confidence_baseline.expect("seeded");
        assert!((confidence_baseline - 0.8).abs() < 1e-12);
        assert_eq!(state.entropy_baseline, Some(2.0));
        assert_eq!(state.kl_baseline_ema, Some(0.0));
        assert_eq!(state.last_action, DriftAction::None);
    }

    #[test]
    fn large_confidence_inflation_triggers_containment() {
        let mut monitor = monitor();
        monitor.set_baseline(0.5, 2.0);
        feed(&mut monitor, 50, 0.95, 2.0, 10.0);
        let evaluation = monitor
            .state()
            .last_evaluation
            .expect("evaluation recorded");
        // r_c = 1.9, |1.9 ln 1.9| ≈ 1.2195 > 0.45 floor.
        assert!(evaluation.kl > 1.2 && evaluation.kl < 1.25, "kl={}", evaluation.kl);
        assert_eq!(evaluation.action, DriftAction::Containment);
        assert!(evaluation.confidence_inflation > 0.44);
    }

    #[test]
    fn moderate_drift_warns_between_floors() {
        let mut monitor = monitor();
        monitor.set_baseline(0.5, 2.0);
        // r_c = 1.3: 1.3 ln 1.3 ≈ 0.341; r_e = 0.9: |0.9 ln 0.9| ≈ 0.0948.
        feed(&mut monitor, 50, 0.65, 1.8, 0.0);
        let evaluation = monitor.state().last_evaluation.expect("evaluation");
        assert!(evaluation.kl > 0.35 && evaluation.kl < 0.45, "kl={}", evaluation.kl);
        assert_eq!(evaluation.action, DriftAction::Warning);
        assert!((evaluation.entropy_collapse - 0.1).abs() < 1e-9);
    }

    #[test]
    fn thresholds_scale_with_a_shifted_baseline() {
        let mut monitor = monitor();
        monitor.restore(&DriftBaseline {
            kl_baseline_ema: Some(0.5),
            confidence_baseline: Some(0.5),
            entropy_baseline: Some(2.0),
            ..DriftBaseline::default()
        });
        feed(&mut monitor, 50, 0.65, 1.8, 0.0);
        let evaluation = monitor.state().last_evaluation.expect("evaluation");
        assert!((evaluation.warn_threshold - 0.75).abs() < 1e-12);
        assert!((evaluation.contain_threshold - 1.0).abs() < 1e-12);
        assert_eq!(evaluation.action, DriftAction::None);
    }

    #[test]
    fn duplicate_spike_bumps_knobs_additively_and_caps_them() {
        let mut monitor = monitor();
        for _ in 0..10 {
            feed(&mut monitor, 50, 0.8, 2.0, 90.0);
        }
        let adj = monitor.adjustments();
        assert!((adj.confidence_threshold_adj - 0.10).abs() < 1e-12);
        assert!((adj.abstention_band_adj - 0.15).abs() < 1e-12);
        assert!(monitor.state().review_alert);
    }

    #[test]
    fn knobs_decay_once_the_spike_subsides() {
        let mut monitor = monitor();
        feed(&mut monitor, 50, 0.8, 2.0, 90.0);
        let bumped = monitor.adjustments();
        assert!((bumped.confidence_threshold_adj - 0.02).abs() < 1e-12);
        assert!((bumped.abstention_band_adj - 0.03).abs() < 1e-12);

        // The spike stays above 20% of the window for three more evaluations,
        // then decays 0.005 per evaluation.
        for _ in 0..40 {
            feed(&mut monitor, 50, 0.8, 2.0, 0.0);
        }
        let decayed = monitor.adjustments();
        assert_eq!(decayed.confidence_threshold_adj, 0.0);
        assert_eq!(decayed.abstention_band_adj, 0.0);
        assert!(!monitor.state().review_alert);
    }

    #[test]
    fn zero_baseline_is_clamped_instead_of_dividing_by_zero() {
        let mut monitor = monitor();
        monitor.set_baseline(0.0, 0.0);
        feed(&mut monitor, 50, 0.5, 1.0, 0.0);
        let evaluation = monitor.state().last_evaluation.expect("evaluation");
        assert!(evaluation.kl.is_finite());
        assert_eq!(evaluation.action, DriftAction::Containment);
    }

    #[test]
    fn non_finite_samples_are_sanitized_conservatively() {
        let mut monitor = monitor();
        monitor.set_baseline(0.5, 2.0);
        for i in 0..50 {
            monitor.record(DriftSample::new(f64::NAN, f64::NAN, f64::NAN, 1 + i));
        }
        let evaluation = monitor.state().last_evaluation.expect("evaluation");
        assert!(evaluation.kl.is_finite());
        assert_eq!(evaluation.action, DriftAction::Containment);
        assert!(evaluation.review_alert);
    }

    #[test]
    fn metrics_are_idempotent_and_reset_clears_baselines() {
        let mut monitor = monitor();
        feed(&mut monitor, 75, 0.8, 2.0, 10.0);
        assert_eq!(monitor.state(), monitor.state());
        monitor.reset();
        let state = monitor.state();
        assert_eq!(state.window_len, 0);
        assert_eq!(state.kl_baseline_ema, None);
        assert_eq!(state.confidence_baseline, None);
    }
}
