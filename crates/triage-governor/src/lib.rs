#![forbid(unsafe_code)]

//! Runtime precision and drift containment for an autonomous decision
//! pipeline.
//!
//! The engine never classifies. It watches a classifier's rolling precision
//! and input drift per field, gates each decision through a fail-closed
//! filter, chains every decision into a tamper-evident log, and strips the
//! model of authority the moment any trigger fires. Authority only comes
//! back through an explicit revalidation.
//!
//! [`FieldSupervisor`] wires one field together; [`FieldRegistry`] keeps a
//! field to a single writer. The member crates are re-exported for callers
//! that need the pieces individually.

mod config;
mod registry;
mod supervisor;

pub use config::{ConfigError, GovernanceConfig};
pub use registry::{FieldLease, FieldRegistry, RegistryError};
pub use supervisor::{
    FieldSupervisor, FreezeReport, LiveDecision, LiveMetrics, SupervisedDecision,
    SupervisorError,
};

pub use tg_chain as chain;
pub use tg_determinism as determinism;
pub use tg_freeze as freeze;
pub use tg_gate as gate;
pub use tg_monitor as monitor;
pub use tg_persist as persist;
pub use tg_runtime as runtime;
pub use tg_types as types;
pub use tg_window as window;

pub use tg_chain::{ChainRecord, DecisionHashChain};
pub use tg_freeze::FreezeSnapshot;
pub use tg_gate::{ChannelSignal, GateRequest, GateVerdict};
pub use tg_persist::{PersistedState, load_or_unbaselined, save_state};
pub use tg_runtime::{
    ContainmentController, ContainmentIncident, GovernanceMode, HmacSha256Signer, Sha256Digest,
    TriggerKind,
};
pub use tg_types::{DecisionOutcome, DriftSample, FieldId};
