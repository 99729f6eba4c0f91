#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tg_types::{FieldId, TypeError, require_non_negative};

/// Output of one training/evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub seed: u64,
    pub field_id: FieldId,
    pub epoch: u32,
    pub output_hash: String,
    pub precision: f64,
    pub ece: f64,
}

/// The same evaluation replayed on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub seed: u64,
    pub field_id: FieldId,
    pub epoch: u32,
    pub output_hash: String,
    pub precision: f64,
    pub ece: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub precision: f64,
    pub ece: f64,
}

impl Tolerances {
    #[must_use]
    pub fn runs() -> Self {
        Self {
            precision: 1e-6,
            ece: 1e-5,
        }
    }

    #[must_use]
    pub fn devices() -> Self {
        Self {
            precision: 1e-4,
            ece: 1e-4,
        }
    }

    pub fn validate(&self) -> Result<(), TypeError> {
        require_non_negative("precision_tolerance", self.precision)?;
        require_non_negative("ece_tolerance", self.ece)?;
        Ok(())
    }
}

impl Default for Tolerances {
    fn default() -> Self {
        Self::runs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterminismTolerances {
    pub runs: Tolerances,
    pub devices: Tolerances,
}

impl Default for DeterminismTolerances {
    fn default() -> Self {
        Self {
            runs: Tolerances::runs(),
            devices: Tolerances::devices(),
        }
    }
}

impl DeterminismTolerances {
    pub fn validate(&self) -> Result<(), TypeError> {
        self.runs.validate()?;
        self.devices.validate()
    }
}

/// Checked in declaration order; the first failing dimension ends the
/// comparison for that record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchDimension {
    Seed,
    Field,
    Epoch,
    Hash,
    Precision,
    Ece,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pass,
    InsufficientRuns,
    InsufficientDevices,
    SeedMismatch,
    FieldMismatch,
    EpochMismatch,
    HashMismatch,
    PrecisionMismatch,
    EceMismatch,
    Multiple,
}

impl From<MismatchDimension> for ValidationStatus {
    fn from(dimension: MismatchDimension) -> Self {
        match dimension {
            MismatchDimension::Seed => Self::SeedMismatch,
            MismatchDimension::Field => Self::FieldMismatch,
            MismatchDimension::Epoch => Self::EpochMismatch,
            MismatchDimension::Hash => Self::HashMismatch,
            MismatchDimension::Precision => Self::PrecisionMismatch,
            MismatchDimension::Ece => Self::EceMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub subject_id: String,
    pub dimension: MismatchDimension,
    pub expected: String,
    pub observed: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismReport {
    pub status: ValidationStatus,
    pub training_allowed: bool,
    pub compared: usize,
    pub mismatches: Vec<Mismatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossDeviceReport {
    pub status: ValidationStatus,
    pub merge_allowed: bool,
    pub compared: usize,
    pub mismatches: Vec<Mismatch>,
}

trait Reproduction {
    fn subject_id(&self) -> &str;
    fn seed(&self) -> u64;
    fn field_id(&self) -> &FieldId;
    fn epoch(&self) -> u32;
    fn output_hash(&self) -> &str;
    fn precision(&self) -> f64;
    fn ece(&self) -> f64;
}

macro_rules! impl_reproduction {
    ($ty:ty, $id:ident) => {
        impl Reproduction for $ty {
            fn subject_id(&self) -> &str {
                &self.$id
            }
            fn seed(&self) -> u64 {
                self.seed
            }
            fn field_id(&self) -> &FieldId {
                &self.field_id
            }
            fn epoch(&self) -> u32 {
                self.epoch
            }
            fn output_hash(&self) -> &str {
                &self.output_hash
            }
            fn precision(&self) -> f64 {
                self.precision
            }
            fn ece(&self) -> f64 {
                self.ece
            }
        }
    };
}

impl_reproduction!(RunResult, run_id);
impl_reproduction!(DeviceReport, device_id);

fn first_mismatch<T: Reproduction>(
    reference: &T,
    candidate: &T,
    tolerances: Tolerances,
) -> Option<Mismatch> {
    let mismatch = |dimension, expected: String, observed: String| Mismatch {
        subject_id: candidate.subject_id().to_owned(),
        dimension,
        expected,
        observed,
    };
    if reference.seed() != candidate.seed() {
        return Some(mismatch(
            MismatchDimension::Seed,
            reference.seed().to_string(),
            candidate.seed().to_string(),
        ));
    }
    if reference.field_id() != candidate.field_id() {
        return Some(mismatch(
            MismatchDimension::Field,
            reference.field_id().to_string(),
            candidate.field_id().to_string(),
        ));
    }
    if reference.epoch() != candidate.epoch() {
        return Some(mismatch(
            MismatchDimension::Epoch,
            reference.epoch().to_string(),
            candidate.epoch().to_string(),
        ));
    }
    if reference.output_hash() != candidate.output_hash() {
        return Some(mismatch(
            MismatchDimension::Hash,
            reference.output_hash().to_owned(),
            candidate.output_hash().to_owned(),
        ));
    }
    if !within(reference.precision(), candidate.precision(), tolerances.precision) {
        return Some(mismatch(
            MismatchDimension::Precision,
            reference.precision().to_string(),
            candidate.precision().to_string(),
        ));
    }
    if !within(reference.ece(), candidate.ece(), tolerances.ece) {
        return Some(mismatch(
            MismatchDimension::Ece,
            reference.ece().to_string(),
            candidate.ece().to_string(),
        ));
    }
    None
}

/// NaN on either side never matches.
fn within(expected: f64, observed: f64, tolerance: f64) -> bool {
    (expected - observed).abs() <= tolerance
}

struct Comparison {
    status: ValidationStatus,
    compared: usize,
    mismatches: Vec<Mismatch>,
}

fn compare<T: Reproduction>(
    records: &[T],
    tolerances: Tolerances,
    insufficient: ValidationStatus,
) -> Comparison {
    let Some((reference, rest)) = records.split_first() else {
        return Comparison {
            status: insufficient,
            compared: 0,
            mismatches: Vec::new(),
        };
    };
    if rest.is_empty() {
        return Comparison {
            status: insufficient,
            compared: 0,
            mismatches: Vec::new(),
        };
    }

    let mismatches: Vec<Mismatch> = rest
        .iter()
        .filter_map(|candidate| first_mismatch(reference, candidate, tolerances))
        .collect();
    let dimensions: BTreeSet<MismatchDimension> =
        mismatches.iter().map(|m| m.dimension).collect();
    let status = match dimensions.len() {
        0 => ValidationStatus::Pass,
        1 => dimensions
            .first()
            .copied()
            .map_or(ValidationStatus::Multiple, ValidationStatus::from),
        _ => ValidationStatus::Multiple,
    };

    #[cfg(feature = "tracing")]
    if status != ValidationStatus::Pass {
        tracing::warn!(
            ?status,
            mismatches = mismatches.len(),
            reference = reference.subject_id(),
            "reproducibility check failed"
        );
    }

    Comparison {
        status,
        compared: rest.len(),
        mismatches,
    }
}

/// Gates training promotion on bit-for-bit reproducible runs. The first
/// recorded run is the reference.
#[derive(Debug, Clone, Default)]
pub struct DeterminismValidator {
    tolerances: Tolerances,
    runs: Vec<RunResult>,
}

impl DeterminismValidator {
    #[must_use]
    pub fn new(tolerances: Tolerances) -> Self {
        Self {
            tolerances,
            runs: Vec::new(),
        }
    }

    pub fn record_run(&mut self, run: RunResult) {
        self.runs.push(run);
    }

    #[must_use]
    pub fn runs(&self) -> &[RunResult] {
        &self.runs
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    #[must_use]
    pub fn evaluate(&self) -> DeterminismReport {
        let comparison = compare(
            &self.runs,
            self.tolerances,
            ValidationStatus::InsufficientRuns,
        );
        DeterminismReport {
            training_allowed: comparison.status == ValidationStatus::Pass,
            status: comparison.status,
            compared: comparison.compared,
            mismatches: comparison.mismatches,
        }
    }
}

/// Gates merges on agreement across devices. The first report added is the
/// reference.
#[derive(Debug, Clone)]
pub struct CrossDeviceValidator {
    tolerances: Tolerances,
    reports: Vec<DeviceReport>,
}

impl Default for CrossDeviceValidator {
    fn default() -> Self {
        Self::new(Tolerances::devices())
    }
}

impl CrossDeviceValidator {
    #[must_use]
    pub fn new(tolerances: Tolerances) -> Self {
        Self {
            tolerances,
            reports: Vec::new(),
        }
    }

    pub fn add_device_report(&mut self, report: DeviceReport) {
        self.reports.push(report);
    }

    #[must_use]
    pub fn reports(&self) -> &[DeviceReport] {
        &self.reports
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }

    #[must_use]
    pub fn validate(&self) -> CrossDeviceReport {
        let comparison = compare(
            &self.reports,
            self.tolerances,
            ValidationStatus::InsufficientDevices,
        );
        CrossDeviceReport {
            merge_allowed: comparison.status == ValidationStatus::Pass,
            status: comparison.status,
            compared: comparison.compared,
            mismatches: comparison.mismatches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CrossDeviceValidator, DeterminismValidator, DeviceReport, MismatchDimension, RunResult,
        Tolerances, ValidationStatus,
    };
    use proptest::prelude::*;
    use tg_types::FieldId;

    fn device(id: &str, precision: f64) -> DeviceReport {
        DeviceReport {
            device_id: id.to_owned(),
            seed: 42,
            field_id: FieldId::new("web"),
            epoch: 7,
            output_hash: "deadbeef".to_owned(),
            precision,
            ece: 0.015,
        }
    }

    fn run(id: &str) -> RunResult {
        RunResult {
            run_id: id.to_owned(),
            seed: 42,
            field_id: FieldId::new("web"),
            epoch: 3,
            output_hash: "cafe".to_owned(),
            precision: 0.96,
            ece: 0.015,
        }
    }

    #[test]
    fn identical_devices_pass() {
        let mut validator = CrossDeviceValidator::default();
        validator.add_device_report(device("gpu-0", 0.96));
        validator.add_device_report(device("gpu-1", 0.96));
        let report = validator.validate();
        assert_eq!(report.status, ValidationStatus::Pass);
        assert!(report.merge_allowed);
        assert_eq!(report.compared, 1);
    }

    #[test]
    fn precision_delta_beyond_tolerance_blocks_merge() {
        let mut validator = CrossDeviceValidator::default();
        validator.add_device_report(device("gpu-0", 0.96));
        validator.add_device_report(device("gpu-1", 0.9602));
        let report = validator.validate();
        assert_eq!(report.status, ValidationStatus::PrecisionMismatch);
        assert!(!report.merge_allowed);
        assert_eq!(report.mismatches[0].subject_id, "gpu-1");
    }

    #[test]
    fn single_device_is_insufficient() {
        let mut validator = CrossDeviceValidator::default();
        validator.add_device_report(device("gpu-0", 0.96));
        let report = validator.validate();
        assert_eq!(report.status, ValidationStatus::InsufficientDevices);
        assert!(!report.merge_allowed);
        assert_eq!(
            DeterminismValidator::default().evaluate().status,
            ValidationStatus::InsufficientRuns
        );
    }

    #[test]
    fn first_failing_dimension_wins_per_record() {
        let mut validator = DeterminismValidator::new(Tolerances::runs());
        validator.record_run(run("a"));
        let mut bad = run("b");
        bad.seed = 7;
        bad.output_hash = "beef".to_owned();
        validator.record_run(bad);
        let report = validator.evaluate();
        assert_eq!(report.status, ValidationStatus::SeedMismatch);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].dimension, MismatchDimension::Seed);
        assert_eq!(report.mismatches[0].expected, "42");
    }

    #[test]
    fn distinct_failures_across_records_are_multiple() {
        let mut validator = DeterminismValidator::new(Tolerances::runs());
        validator.record_run(run("a"));
        let mut hash = run("b");
        hash.output_hash = "beef".to_owned();
        let mut ece = run("c");
        ece.ece = 0.02;
        validator.record_run(hash);
        validator.record_run(ece);
        let report = validator.evaluate();
        assert_eq!(report.status, ValidationStatus::Multiple);
        assert!(!report.training_allowed);
        assert_eq!(report.compared, 2);
    }

    #[test]
    fn nan_metrics_never_match() {
        let mut validator = DeterminismValidator::new(Tolerances::runs());
        let mut a = run("a");
        a.precision = f64::NAN;
        let mut b = run("b");
        b.precision = f64::NAN;
        validator.record_run(a);
        validator.record_run(b);
        assert_eq!(
            validator.evaluate().status,
            ValidationStatus::PrecisionMismatch
        );
    }

    #[test]
    fn run_tolerance_is_tighter_than_device_tolerance() {
        let mut validator = DeterminismValidator::new(Tolerances::runs());
        validator.record_run(run("a"));
        let mut close = run("b");
        close.precision = 0.96 + 5e-6;
        validator.record_run(close);
        assert_eq!(
            validator.evaluate().status,
            ValidationStatus::PrecisionMismatch
        );
    }

    #[test]
    fn report_serializes_snake_case() {
        let mut validator = CrossDeviceValidator::default();
        validator.add_device_report(device("gpu-0", 0.96));
        let json = serde_json::to_value(validator.validate()).expect("serialize");
        assert_eq!(json["status"], "insufficient_devices");
    }

    proptest! {
        #[test]
        fn status_is_independent_of_candidate_order(
            flags in proptest::collection::vec(0u8..4, 1..6),
        ) {
            let candidates: Vec<RunResult> = flags
                .iter()
                .enumerate()
                .map(|(i, flag)| {
                    let mut r = run(&format!("r{i}"));
                    match flag {
                        1 => r.epoch = 99,
                        2 => r.output_hash = "other".to_owned(),
                        3 => r.ece = 0.5,
                        _ => {}
                    }
                    r
                })
                .collect();

            let mut forward = DeterminismValidator::new(Tolerances::runs());
            let mut backward = DeterminismValidator::new(Tolerances::runs());
            forward.record_run(run("ref"));
            backward.record_run(run("ref"));
            for c in &candidates {
                forward.record_run(c.clone());
            }
            for c in candidates.iter().rev() {
                backward.record_run(c.clone());
            }
            prop_assert_eq!(forward.evaluate().status, backward.evaluate().status);
        }
    }
}
