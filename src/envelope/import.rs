//! Envelope import from JSON.
//!
//! Handles deserialization of envelope state, including normalization of
//! legacy artifacts produced by non-Rust writers (float-encoded integers).

use serde::Deserialize;

/// Deserialize an envelope from JSON bytes.
pub fn from_json(bytes: &[u8]) -> crate::types::Result<super::Envelope> {
    serde_json::from_slice(bytes).map_err(crate::types::Error::from)
}

/// Deserialize an envelope from a JSON string.
pub fn from_json_str(s: &str) -> crate::types::Result<super::Envelope> {
    serde_json::from_str(s).map_err(crate::types::Error::from)
}

/// Custom deserializer for integer fields encoded as floats in JSON.
pub fn deserialize_int_from_float<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let f: f64 = f64::deserialize(deserializer)?;
    if f.fract() != 0.0 {
        return Err(serde::de::Error::custom("non-integer float"));
    }
    Ok(f as u32)
}
