//! Hash and signing collaborators.
//!
//! The engine decides *what* is hashed or signed and *when*; the primitives
//! sit behind these traits so a deployment can route them to an HSM or a
//! different algorithm. SHA-256 and HMAC-SHA-256 are the defaults.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DIGEST_LEN: usize = 32;

pub type Digest32 = [u8; DIGEST_LEN];

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Collision-resistant digest over a sequence of byte slices, hashed as if
/// concatenated.
pub trait DigestFn: fmt::Debug + Send + Sync {
    fn digest(&self, parts: &[&[u8]]) -> Digest32;

    fn algorithm(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl DigestFn for Sha256Digest {
    fn digest(&self, parts: &[&[u8]]) -> Digest32 {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn algorithm(&self) -> &'static str {
        "sha256"
    }
}

/// Keyed signer for audit entries. Signatures are lowercase hex.
pub trait IncidentSigner: fmt::Debug + Send + Sync {
    fn sign(&self, payload: &[u8]) -> String;

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        self.sign(payload) == signature
    }

    fn algorithm(&self) -> &'static str;
}

#[derive(Clone)]
pub struct HmacSha256Signer {
    mac: HmacSha256,
}

impl HmacSha256Signer {
    pub fn new(key: &[u8]) -> Result<Self, IntegrityError> {
        if key.is_empty() {
            return Err(IntegrityError::InvalidKey("key must not be empty".to_owned()));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|err| IntegrityError::InvalidKey(err.to_string()))?;
        Ok(Self { mac })
    }
}

impl fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl IncidentSigner for HmacSha256Signer {
    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    fn algorithm(&self) -> &'static str {
        "hmac-sha256"
    }
}

#[must_use]
pub fn digest_hex(digest: &Digest32) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::{
        DigestFn, HmacSha256Signer, IncidentSigner, IntegrityError, Sha256Digest, digest_hex,
    };

    #[test]
    fn sha256_of_parts_equals_sha256_of_concatenation() {
        let split = Sha256Digest.digest(&[b"ab".as_slice(), b"c".as_slice()]);
        let whole = Sha256Digest.digest(&[b"abc".as_slice()]);
        assert_eq!(split, whole);
        assert_eq!(
            digest_hex(&whole),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hmac_signatures_verify_and_reject_tampering() {
        let signer = HmacSha256Signer::new(b"governance-key").expect("signer");
        let signature = signer.sign(b"incident-1");
        assert_eq!(signature.len(), 64);
        assert!(signer.verify(b"incident-1", &signature));
        assert!(!signer.verify(b"incident-2", &signature));
        assert!(!signer.verify(b"incident-1", "not-hex"));
    }

    #[test]
    fn different_keys_produce_different_signatures() {
        let a = HmacSha256Signer::new(b"key-a").expect("signer");
        let b = HmacSha256Signer::new(b"key-b").expect("signer");
        assert_ne!(a.sign(b"payload"), b.sign(b"payload"));
    }

    #[test]
    fn empty_key_is_rejected_and_debug_redacts() {
        assert!(matches!(
            HmacSha256Signer::new(b""),
            Err(IntegrityError::InvalidKey(_))
        ));
        let signer = HmacSha256Signer::new(b"secret").expect("signer");
        assert!(!format!("{signer:?}").contains("secret"));
    }
}
