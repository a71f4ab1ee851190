//! Envelope export to JSON.

/// Serialize an envelope to JSON bytes.
pub fn to_json(envelope: &super::Envelope) -> crate::types::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(crate::types::Error::from)
}

/// Serialize an envelope to a pretty-printed JSON string, for logs and fixtures.
pub fn to_json_pretty(envelope: &super::Envelope) -> crate::types::Result<String> {
    serde_json::to_string_pretty(envelope).map_err(crate::types::Error::from)
}
