#![forbid(unsafe_code)]

#[cfg(feature = "sqlite-audit")]
pub mod sqlite;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_monitor::{DriftBaseline, PrecisionBaseline};
use tg_types::{FieldId, UnixMillis};

#[cfg(feature = "sqlite-audit")]
pub use sqlite::SqliteAuditStore;

pub const STATE_VERSION: u32 = 1;

/// On-disk monitor baselines for one field. Serialized as one flat JSON
/// object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub field_id: FieldId,
    pub saved_at_ms: UnixMillis,
    #[serde(flatten)]
    pub precision: PrecisionBaseline,
    #[serde(flatten)]
    pub drift: DriftBaseline,
}

impl PersistedState {
    #[must_use]
    pub fn new(
        field_id: FieldId,
        saved_at_ms: UnixMillis,
        precision: PrecisionBaseline,
        drift: DriftBaseline,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            field_id,
            saved_at_ms,
            precision,
            drift,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state file {0} does not exist")]
    Missing(PathBuf),
    #[error("state version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("state is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("line {line} of audit export is corrupt: {source}")]
    CorruptLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{field} value {value} does not fit the audit store")]
    OutOfRange { field: &'static str, value: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(feature = "sqlite-audit")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

pub fn parse_state(bytes: &[u8]) -> Result<PersistedState, PersistError> {
    let header: VersionHeader = serde_json::from_slice(bytes).map_err(PersistError::Corrupt)?;
    if header.version != STATE_VERSION {
        return Err(PersistError::VersionMismatch {
            found: header.version,
            expected: STATE_VERSION,
        });
    }
    serde_json::from_slice(bytes).map_err(PersistError::Corrupt)
}

pub fn load_state(path: &Path) -> Result<PersistedState, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PersistError::Missing(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    parse_state(&bytes)
}

/// Load a baseline, treating any failure as "no baseline". Monitors then
/// start un-baselined rather than assuming the last state was safe.
#[must_use]
pub fn load_or_unbaselined(path: &Path) -> Option<PersistedState> {
    load_state(path)
        .map_err(|_err| {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                path = %path.display(),
                error = %_err,
                "state file unusable; starting un-baselined"
            );
        })
        .ok()
}

/// Atomically replace `path`: write a sibling temp file, flush and fsync
/// it, rename over the target, then fsync the directory.
pub fn save_state(path: &Path, state: &PersistedState) -> Result<(), PersistError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(PersistError::Encode)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    fs::create_dir_all(&parent)?;

    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = parent.join(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(&parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Append one JSON document per line. Existing content is never rewritten.
pub fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<usize, PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut writer, item).map_err(PersistError::Encode)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(items.len())
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PersistError::Missing(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    let mut items = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line).map_err(|source| PersistError::CorruptLine {
            line: index + 1,
            source,
        })?;
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::{
        PersistError, PersistedState, STATE_VERSION, append_jsonl, load_or_unbaselined,
        load_state, parse_state, read_jsonl, save_state,
    };
    use tg_chain::{ChainRecord, DecisionHashChain, DecisionInput};
    use tg_monitor::{ConfusionCounts, DriftBaseline, PrecisionBaseline};
    use tg_runtime::{ContainmentConfig, ContainmentController, ContainmentIncident};
    use tg_types::{FieldId, GateAdjustments};

    fn sample_state() -> PersistedState {
        PersistedState::new(
            FieldId::new("web"),
            1_700_000_000_000,
            PrecisionBaseline {
                rolling_precision: 0.96,
                previous_precision: Some(0.955),
                window_len: 1_000,
                counts: ConfusionCounts {
                    tp: 480,
                    fp: 20,
                    tn: 490,
                    fn_: 10,
                },
            },
            DriftBaseline {
                kl_baseline_ema: Some(0.12),
                entropy_baseline: Some(2.5),
                confidence_baseline: Some(0.9),
                duplicate_cluster_baseline: Some(0.05),
                adjustments: GateAdjustments {
                    confidence_threshold_adj: 0.02,
                    abstention_band_adj: 0.03,
                },
            },
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let state = sample_state();
        save_state(&path, &state).expect("save");
        assert_eq!(load_state(&path).expect("load"), state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn state_is_a_flat_json_object() {
        let json = serde_json::to_value(sample_state()).expect("serialize");
        let object = json.as_object().expect("object");
        for key in [
            "version",
            "field_id",
            "saved_at_ms",
            "rolling_precision",
            "previous_precision",
            "window_len",
            "tp",
            "fp",
            "tn",
            "fn",
            "kl_baseline_ema",
            "entropy_baseline",
            "confidence_baseline",
            "duplicate_cluster_baseline",
            "confidence_threshold_adj",
            "abstention_band_adj",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object["version"], STATE_VERSION);
    }

    #[test]
    fn overwrite_replaces_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        save_state(&path, &sample_state()).expect("save");
        let mut newer = sample_state();
        newer.saved_at_ms += 60_000;
        save_state(&path, &newer).expect("save");
        assert_eq!(load_state(&path).expect("load").saved_at_ms, newer.saved_at_ms);
    }

    #[test]
    fn version_mismatch_and_missing_fall_back_to_unbaselined() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        assert!(matches!(load_state(&missing), Err(PersistError::Missing(_))));
        assert_eq!(load_or_unbaselined(&missing), None);

        let future = dir.path().join("future.json");
        let mut json = serde_json::to_value(sample_state()).expect("serialize");
        json["version"] = serde_json::json!(2);
        std::fs::write(&future, serde_json::to_vec(&json).expect("encode")).expect("write");
        assert!(matches!(
            load_state(&future),
            Err(PersistError::VersionMismatch { found: 2, expected: 1 })
        ));
        assert_eq!(load_or_unbaselined(&future), None);
    }

    #[test]
    fn truncated_state_is_corrupt() {
        assert!(matches!(
            parse_state(b"{\"version\":1,\"field_id\":"),
            Err(PersistError::Corrupt(_))
        ));
        assert!(matches!(
            parse_state(b"{\"version\":1}"),
            Err(PersistError::Corrupt(_))
        ));
    }

    #[test]
    fn jsonl_appends_without_truncating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chain.jsonl");
        let mut chain = DecisionHashChain::default();
        for value in [0.1, 0.2, 0.3] {
            chain.record_decision(DecisionInput {
                features: &[value],
                logits: &[1.0, 0.0],
                temperature: 1.0,
                predicted_class: 0,
                confidence: 0.9,
            });
        }
        append_jsonl(&path, &chain.records()[..2]).expect("append");
        append_jsonl(&path, &chain.records()[2..]).expect("append");

        let records: Vec<ChainRecord> = read_jsonl(&path).expect("read");
        assert_eq!(records, chain.records());
        let imported = DecisionHashChain::from_records(records, Box::new(tg_runtime::Sha256Digest));
        assert!(imported.verify_chain());
    }

    #[test]
    fn nan_incident_history_reads_back_from_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("incidents.jsonl");
        let mut ctl = ContainmentController::with_hmac_key(ContainmentConfig::default(), b"k")
            .expect("controller");
        assert!(ctl.check_calibration_inflation(f64::NAN));
        assert!(ctl.unlock_after_revalidation("recalibrated"));
        assert!(ctl.check_drift_spike(3.0));
        append_jsonl(&path, ctl.incidents()).expect("append");

        let incidents: Vec<ContainmentIncident> = read_jsonl(&path).expect("read");
        assert_eq!(incidents.len(), 2);
        assert!(incidents[0].trigger_value.is_nan());
        assert_eq!(incidents[1].trigger_value, 3.0);
        assert!(incidents.iter().all(|incident| ctl.verify_incident(incident)));
    }

    #[test]
    fn corrupt_jsonl_line_is_located() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\nnot json\n").expect("write");
        let err = read_jsonl::<serde_json::Value>(&path).expect_err("must fail");
        assert!(matches!(err, PersistError::CorruptLine { line: 3, .. }));
    }
}
