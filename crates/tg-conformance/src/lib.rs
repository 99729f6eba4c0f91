#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_chain::{DecisionHashChain, DecisionInput};
use tg_determinism::{
    CrossDeviceValidator, DeterminismValidator, DeviceReport, RunResult, Tolerances,
    ValidationStatus,
};
use tg_monitor::{
    DriftAction, DriftConfig, DriftMonitor, MonitorError, PrecisionAction, PrecisionConfig,
    PrecisionMonitor,
};
use tg_runtime::{
    ContainmentConfig, ContainmentController, GovernanceMode, RuntimeError, TriggerKind,
};
use tg_types::{DecisionOutcome, DriftSample, UnixMillis};

const HARNESS_SIGNING_KEY: &[u8] = b"tg-conformance-harness";
const STEP_MS: UnixMillis = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub repo_root: PathBuf,
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            repo_root,
        }
    }

    #[must_use]
    pub fn scenario_fixture_root(&self) -> PathBuf {
        self.fixture_root.join("scenarios")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_root_present: bool,
    pub fixture_count: usize,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = list_fixture_files(&config.scenario_fixture_root())
        .map(|files| files.len())
        .unwrap_or(0);
    HarnessReport {
        suite: "smoke",
        fixture_root_present: config.fixture_root.exists(),
        fixture_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    PrecisionStream,
    DriftStream,
    CrossDevice,
    DeterminismRuns,
    HashChain,
    Containment,
}

/// `count` identical labelled outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBatch {
    pub count: usize,
    pub predicted_positive: bool,
    pub actually_positive: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftBatch {
    pub count: usize,
    pub confidence: f64,
    pub feature_entropy: f64,
    #[serde(default)]
    pub duplicate_risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDecision {
    pub features: Vec<f64>,
    pub logits: Vec<f64>,
    pub temperature: f64,
    pub predicted_class: u32,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperTarget {
    DecisionHash,
    ChainHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureTamper {
    pub sequence_id: u64,
    pub target: TamperTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixtureTrigger {
    pub trigger: TriggerKind,
    pub value: f64,
    /// Defaults to the configured threshold for `trigger`.
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Every field is optional; only the ones present are compared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioExpectation {
    pub precision_action: Option<PrecisionAction>,
    pub rolling_precision: Option<f64>,
    pub demotion_triggered: Option<bool>,
    pub rapid_drop_detected: Option<bool>,
    pub drift_action: Option<DriftAction>,
    pub review_alert: Option<bool>,
    pub confidence_threshold_adj: Option<f64>,
    pub validation_status: Option<ValidationStatus>,
    pub allowed: Option<bool>,
    pub chain_valid: Option<bool>,
    pub first_break: Option<u64>,
    pub locked: Option<bool>,
    pub mode: Option<GovernanceMode>,
    pub incident_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFixture {
    pub case_id: String,
    pub operation: FixtureOperation,
    #[serde(default)]
    pub precision_config: Option<PrecisionConfig>,
    #[serde(default)]
    pub drift_config: Option<DriftConfig>,
    #[serde(default)]
    pub outcomes: Vec<OutcomeBatch>,
    #[serde(default)]
    pub drift_baseline: Option<(f64, f64)>,
    #[serde(default)]
    pub drift_batches: Vec<DriftBatch>,
    #[serde(default)]
    pub devices: Vec<DeviceReport>,
    #[serde(default)]
    pub runs: Vec<RunResult>,
    #[serde(default)]
    pub decisions: Vec<FixtureDecision>,
    #[serde(default)]
    pub tamper: Option<FixtureTamper>,
    #[serde(default)]
    pub enable_shadow: bool,
    #[serde(default)]
    pub triggers: Vec<FixtureTrigger>,
    #[serde(default)]
    pub unlock_after: bool,
    pub expected: ScenarioExpectation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub fn run_scenario_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, None)?;
    build_report("scenarios".to_owned(), &fixtures)
}

pub fn run_scenario_by_id(
    config: &HarnessConfig,
    case_id: &str,
) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, Some(case_id))?;
    build_report(format!("scenarios:{case_id}"), &fixtures)
}

fn build_report(suite: String, fixtures: &[ScenarioFixture]) -> Result<SuiteReport, HarnessError> {
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in fixtures {
        results.push(run_fixture(fixture)?);
    }
    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    Ok(SuiteReport {
        suite,
        fixture_count: results.len(),
        passed: results.len().saturating_sub(failed),
        failed,
        results,
    })
}

fn load_fixtures(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<ScenarioFixture>, HarnessError> {
    let mut fixtures = Vec::new();
    for path in list_fixture_files(&config.scenario_fixture_root())? {
        let fixture = load_fixture(&path)?;
        if case_filter.is_none_or(|case| fixture.case_id == case) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

pub fn load_fixture(path: &Path) -> Result<ScenarioFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    serde_json::from_str(&body).map_err(|source| HarnessError::Fixture {
        path: path.to_path_buf(),
        source,
    })
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Replay one fixture. Construction failures are errors; behavioral
/// differences become a failing [`CaseResult`].
pub fn run_fixture(fixture: &ScenarioFixture) -> Result<CaseResult, HarnessError> {
    let mismatch = match fixture.operation {
        FixtureOperation::PrecisionStream => run_precision_stream(fixture)?,
        FixtureOperation::DriftStream => run_drift_stream(fixture)?,
        FixtureOperation::CrossDevice => run_cross_device(fixture),
        FixtureOperation::DeterminismRuns => run_determinism(fixture),
        FixtureOperation::HashChain => run_hash_chain(fixture),
        FixtureOperation::Containment => run_containment(fixture)?,
    }
    .err();

    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        operation: fixture.operation,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
    })
}

type Check = Result<(), String>;

fn expect_eq<T: PartialEq + std::fmt::Debug>(
    label: &str,
    expected: Option<T>,
    actual: T,
) -> Check {
    match expected {
        Some(expected) if expected != actual => {
            Err(format!("{label}: expected {expected:?}, got {actual:?}"))
        }
        _ => Ok(()),
    }
}

fn expect_close(label: &str, expected: Option<f64>, actual: f64) -> Check {
    match expected {
        Some(expected) if (expected - actual).abs() > 1e-9 => {
            Err(format!("{label}: expected {expected}, got {actual}"))
        }
        _ => Ok(()),
    }
}

fn run_precision_stream(fixture: &ScenarioFixture) -> Result<Check, HarnessError> {
    let config = fixture.precision_config.clone().unwrap_or_default();
    let mut monitor = PrecisionMonitor::new(config)?;
    let mut ts = 0;
    for batch in &fixture.outcomes {
        for _ in 0..batch.count {
            ts += STEP_MS;
            monitor.record(DecisionOutcome::new(
                batch.predicted_positive,
                batch.actually_positive,
                batch.confidence,
                ts,
            ));
        }
    }
    let state = monitor.state();
    let expected = &fixture.expected;
    Ok(expect_eq("precision_action", expected.precision_action, state.last_action)
        .and(expect_close(
            "rolling_precision",
            expected.rolling_precision,
            state.rolling_precision,
        ))
        .and(expect_eq(
            "demotion_triggered",
            expected.demotion_triggered,
            state.demotion_triggered,
        ))
        .and(expect_eq(
            "rapid_drop_detected",
            expected.rapid_drop_detected,
            state.rapid_drop_detected,
        )))
}

fn run_drift_stream(fixture: &ScenarioFixture) -> Result<Check, HarnessError> {
    let config = fixture.drift_config.clone().unwrap_or_default();
    let mut monitor = DriftMonitor::new(config)?;
    if let Some((confidence, entropy)) = fixture.drift_baseline {
        monitor.set_baseline(confidence, entropy);
    }
    let mut ts = 0;
    for batch in &fixture.drift_batches {
        for _ in 0..batch.count {
            ts += STEP_MS;
            monitor.record(DriftSample::new(
                batch.confidence,
                batch.feature_entropy,
                batch.duplicate_risk_score,
                ts,
            ));
        }
    }
    let state = monitor.state();
    let expected = &fixture.expected;
    Ok(expect_eq("drift_action", expected.drift_action, state.last_action)
        .and(expect_eq("review_alert", expected.review_alert, state.review_alert))
        .and(expect_close(
            "confidence_threshold_adj",
            expected.confidence_threshold_adj,
            state.adjustments.confidence_threshold_adj,
        )))
}

fn run_cross_device(fixture: &ScenarioFixture) -> Check {
    let mut validator = CrossDeviceValidator::new(Tolerances::devices());
    for device in &fixture.devices {
        validator.add_device_report(device.clone());
    }
    let report = validator.validate();
    expect_eq(
        "validation_status",
        fixture.expected.validation_status,
        report.status,
    )
    .and(expect_eq("allowed", fixture.expected.allowed, report.merge_allowed))
}

fn run_determinism(fixture: &ScenarioFixture) -> Check {
    let mut validator = DeterminismValidator::new(Tolerances::runs());
    for run in &fixture.runs {
        validator.record_run(run.clone());
    }
    let report = validator.evaluate();
    expect_eq(
        "validation_status",
        fixture.expected.validation_status,
        report.status,
    )
    .and(expect_eq(
        "allowed",
        fixture.expected.allowed,
        report.training_allowed,
    ))
}

fn run_hash_chain(fixture: &ScenarioFixture) -> Check {
    let mut chain = DecisionHashChain::default();
    for decision in &fixture.decisions {
        chain.record_decision(DecisionInput {
            features: &decision.features,
            logits: &decision.logits,
            temperature: decision.temperature,
            predicted_class: decision.predicted_class,
            confidence: decision.confidence,
        });
    }

    let mut records = chain.records().to_vec();
    if let Some(tamper) = fixture.tamper {
        let record = records
            .iter_mut()
            .find(|record| record.sequence_id == tamper.sequence_id)
            .ok_or_else(|| format!("tamper target {} does not exist", tamper.sequence_id))?;
        let hash = match tamper.target {
            TamperTarget::DecisionHash => &mut record.decision_hash,
            TamperTarget::ChainHash => &mut record.chain_hash,
        };
        hash[0] ^= 0x01;
    }
    let replayed = DecisionHashChain::from_records(records, Box::new(tg_runtime::Sha256Digest));
    let report = replayed.verify_report();

    expect_eq("chain_valid", fixture.expected.chain_valid, report.is_intact()).and(
        match fixture.expected.first_break {
            Some(expected) => expect_eq(
                "first_break",
                Some(Some(expected)),
                report.first_break.map(|b| b.sequence_id),
            ),
            None => Ok(()),
        },
    )
}

fn run_containment(fixture: &ScenarioFixture) -> Result<Check, HarnessError> {
    let config = ContainmentConfig::default();
    let mut controller = ContainmentController::with_hmac_key(config.clone(), HARNESS_SIGNING_KEY)?;
    if fixture.enable_shadow {
        controller.enable_shadow_mode();
    }
    for step in &fixture.triggers {
        let threshold = step
            .threshold
            .unwrap_or_else(|| default_threshold(step.trigger, &config));
        controller.check_and_contain(
            step.trigger,
            step.value,
            threshold,
            format!("scenario {} step", fixture.case_id),
        );
    }
    if fixture.unlock_after {
        controller.unlock_after_revalidation("scenario revalidation");
    }

    let unverified = controller
        .incidents()
        .iter()
        .find(|incident| !controller.verify_incident(incident))
        .map(|incident| incident.incident_id);
    let expected = &fixture.expected;
    Ok(expect_eq("unverified_incident", Some(None), unverified)
        .and(expect_eq("locked", expected.locked, controller.is_locked()))
        .and(expect_eq("mode", expected.mode, controller.current_mode()))
        .and(expect_eq(
            "incident_count",
            expected.incident_count,
            controller.incidents().len(),
        )))
}

fn default_threshold(trigger: TriggerKind, config: &ContainmentConfig) -> f64 {
    match trigger {
        TriggerKind::DriftSpike => config.drift_spike_sigma,
        TriggerKind::EntropyCollapse => config.entropy_collapse,
        TriggerKind::CalibrationInflation => config.calibration_inflation,
        TriggerKind::ConsensusDivergence => config.consensus_divergence,
        TriggerKind::ModelAging => config.model_aging_days,
        TriggerKind::RapidPrecisionDrop => config.rapid_precision_drop,
        TriggerKind::KlDivergence => DriftConfig::default().contain_floor,
        TriggerKind::FreezeInvalidated => 0.0,
    }
}
