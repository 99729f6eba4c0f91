use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_determinism::DeterminismTolerances;
use tg_freeze::FreezeConfig;
use tg_gate::GateConfig;
use tg_monitor::{DriftConfig, PrecisionConfig};
use tg_runtime::ContainmentConfig;
use tg_types::TypeError;

/// Every tunable threshold of one deployment. Missing sections and keys take
/// their documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub precision: PrecisionConfig,
    pub drift: DriftConfig,
    pub containment: ContainmentConfig,
    pub freeze: FreezeConfig,
    pub gate: GateConfig,
    pub determinism: DeterminismTolerances,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] TypeError),
}

impl GovernanceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(body: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(body).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let body = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&body)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.precision.validate()?;
        self.drift.validate()?;
        self.containment.validate()?;
        self.freeze.validate()?;
        self.gate.validate()?;
        self.determinism.validate()?;
        Ok(())
    }
}
