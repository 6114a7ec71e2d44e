//! Payload decoding
//!
//! Byte payloads decode as JSON when the first non-whitespace byte is
//! `{` or `[`, as a string when valid UTF-8, and as raw bytes
//! otherwise. Deterministic and reversible, which is what the tests
//! lean on.

use serde_json::Value;

use crate::error::SyncError;

/// Decode a raw payload per the engine's serialization convention
pub fn decode(bytes: &[u8]) -> Result<Value, SyncError> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    match first {
        Some(b'{') | Some(b'[') => serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Schema(format!("payload looks like JSON but does not parse: {e}"))),
        _ => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Value::String(s.to_string())),
            Err(_) => Ok(Value::Array(
                bytes.iter().map(|b| Value::from(*b as u64)).collect(),
            )),
        },
    }
}
