#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tg_runtime::{DIGEST_LEN, Digest32, DigestFn, Sha256Digest};

pub const GENESIS: Digest32 = [0u8; DIGEST_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    Decision,
    /// Supersedes the record with sequence id `corrects` without touching it.
    Correction { corrects: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub sequence_id: u64,
    pub kind: RecordKind,
    #[serde(with = "hex::serde")]
    pub decision_hash: Digest32,
    #[serde(with = "hex::serde")]
    pub chain_hash: Digest32,
    pub predicted_class: u32,
    #[serde(with = "tg_types::audit_f64")]
    pub confidence: f64,
    #[serde(with = "tg_types::audit_f64")]
    pub temperature: f64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("cannot correct unknown sequence id {0}")]
    UnknownSequence(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored chain hash differs from the recomputed one.
    ChainHash,
    /// Sequence ids are not contiguous from zero.
    Sequence,
    /// A correction points at itself or a later record.
    CorrectionTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub sequence_id: u64,
    pub kind: BreakKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub records_checked: usize,
    pub first_break: Option<ChainBreak>,
}

impl ChainVerification {
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Inputs that identify one model decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInput<'a> {
    pub features: &'a [f64],
    pub logits: &'a [f64],
    pub temperature: f64,
    pub predicted_class: u32,
    pub confidence: f64,
}

/// `H(len || features || len || logits || temperature)` with little-endian
/// u64 lengths and f64 bit patterns. The length prefixes keep a feature
/// vector from bleeding into the logits.
#[must_use]
pub fn decision_hash(
    hasher: &dyn DigestFn,
    features: &[f64],
    logits: &[f64],
    temperature: f64,
) -> Digest32 {
    let mut buf = Vec::with_capacity(8 * (features.len() + logits.len() + 3));
    buf.extend_from_slice(&(features.len() as u64).to_le_bytes());
    for value in features {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&(logits.len() as u64).to_le_bytes());
    for value in logits {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&temperature.to_le_bytes());
    hasher.digest(&[buf.as_slice()])
}

#[must_use]
pub fn link_hash(
    hasher: &dyn DigestFn,
    previous: &Digest32,
    decision_hash: &Digest32,
) -> Digest32 {
    hasher.digest(&[previous.as_slice(), decision_hash.as_slice()])
}

/// Tamper-evident decision log. Records can only be appended; history is
/// amended by appending a correction.
#[derive(Debug)]
pub struct DecisionHashChain {
    records: Vec<ChainRecord>,
    head: Digest32,
    hasher: Box<dyn DigestFn>,
}

impl Default for DecisionHashChain {
    fn default() -> Self {
        Self::new(Box::new(Sha256Digest))
    }
}

impl DecisionHashChain {
    #[must_use]
    pub fn new(hasher: Box<dyn DigestFn>) -> Self {
        Self {
            records: Vec::new(),
            head: GENESIS,
            hasher,
        }
    }

    /// Rebuild a chain from exported records without re-linking them, so
    /// [`DecisionHashChain::verify_chain`] checks what was stored.
    #[must_use]
    pub fn from_records(records: Vec<ChainRecord>, hasher: Box<dyn DigestFn>) -> Self {
        let head = records.last().map_or(GENESIS, |record| record.chain_hash);
        Self {
            records,
            head,
            hasher,
        }
    }

    #[must_use]
    pub fn records(&self) -> &[ChainRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn head(&self) -> Digest32 {
        self.head
    }

    pub fn record_decision(&mut self, input: DecisionInput<'_>) -> &ChainRecord {
        self.append(RecordKind::Decision, input)
    }

    pub fn record_correction(
        &mut self,
        corrects: u64,
        input: DecisionInput<'_>,
    ) -> Result<&ChainRecord, ChainError> {
        if corrects >= self.records.len() as u64 {
            return Err(ChainError::UnknownSequence(corrects));
        }
        Ok(self.append(RecordKind::Correction { corrects }, input))
    }

    fn append(&mut self, kind: RecordKind, input: DecisionInput<'_>) -> &ChainRecord {
        let decision_hash = decision_hash(
            self.hasher.as_ref(),
            input.features,
            input.logits,
            input.temperature,
        );
        let chain_hash = link_hash(self.hasher.as_ref(), &self.head, &decision_hash);
        let sequence_id = self.records.len() as u64;
        self.head = chain_hash;
        self.records.push(ChainRecord {
            sequence_id,
            kind,
            decision_hash,
            chain_hash,
            predicted_class: input.predicted_class,
            confidence: input.confidence,
            temperature: input.temperature,
        });
        &self.records[self.records.len() - 1]
    }

    #[must_use]
    pub fn verify_chain(&self) -> bool {
        self.verify_report().is_intact()
    }

    /// Recompute every link from the zero genesis and report the first
    /// record that does not reproduce.
    #[must_use]
    pub fn verify_report(&self) -> ChainVerification {
        let mut previous = GENESIS;
        for (index, record) in self.records.iter().enumerate() {
            let kind = if record.sequence_id != index as u64 {
                Some(BreakKind::Sequence)
            } else if matches!(record.kind, RecordKind::Correction { corrects } if corrects >= record.sequence_id)
            {
                Some(BreakKind::CorrectionTarget)
            } else if link_hash(self.hasher.as_ref(), &previous, &record.decision_hash)
                != record.chain_hash
            {
                Some(BreakKind::ChainHash)
            } else {
                None
            };
            if let Some(kind) = kind {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    sequence_id = record.sequence_id,
                    ?kind,
                    "decision hash chain broken"
                );
                return ChainVerification {
                    records_checked: index + 1,
                    first_break: Some(ChainBreak {
                        sequence_id: record.sequence_id,
                        kind,
                    }),
                };
            }
            previous = record.chain_hash;
        }
        ChainVerification {
            records_checked: self.records.len(),
            first_break: None,
        }
    }
}
