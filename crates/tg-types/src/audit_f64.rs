//! Serde adapter for floats that must survive a JSON round trip even when
//! they are not finite.
//!
//! JSON has no NaN or infinity, and serde_json writes them as `null`, which
//! then fails to read back as `f64`. Audit records keep those values, so
//! finite numbers stay plain JSON numbers and the rest are written as the
//! strings `"NaN"`, `"inf"` and `"-inf"`.
//!
//! ```ignore
//! #[serde(with = "tg_types::audit_f64")]
//! pub trigger_value: f64,
//! ```

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::Serializer;

const NAN: &str = "NaN";
const POS_INF: &str = "inf";
const NEG_INF: &str = "-inf";

pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_nan() {
        serializer.serialize_str(NAN)
    } else if value.is_infinite() {
        serializer.serialize_str(if *value > 0.0 { POS_INF } else { NEG_INF })
    } else {
        serializer.serialize_f64(*value)
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Repr::deserialize(deserializer)? {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => match text.as_str() {
            NAN => Ok(f64::NAN),
            POS_INF => Ok(f64::INFINITY),
            NEG_INF => Ok(f64::NEG_INFINITY),
            other => Err(de::Error::invalid_value(
                de::Unexpected::Str(other),
                &"a number, \"NaN\", \"inf\" or \"-inf\"",
            )),
        },
    }
}

/// Bit pattern used when a float feeds a hash or signature. Every NaN maps
/// to one canonical pattern so a value that went through [`deserialize`]
/// still hashes the same.
#[must_use]
pub fn canonical_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}
