//! # Envelope Codec
//!
//! JSON encoding of the `{header, payload}` envelope.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::Envelope;
use thiserror::Error;

/// Envelope whose payload has not been bound to a type yet.
pub type RawEnvelope = Envelope<serde_json::Value>;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, truncated, or missing header fields.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Well-formed JSON whose payload does not fit the expected type.
    #[error("Payload type mismatch: {0}")]
    PayloadMismatch(String),

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Encode an envelope to bytes.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<Bytes, CodecError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode the header and leave the payload as JSON.
pub fn decode_raw(bytes: &[u8]) -> Result<RawEnvelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decode header and typed payload.
///
/// A broken envelope is `Malformed`; a sound envelope whose payload has the
/// wrong shape is `PayloadMismatch`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, CodecError> {
    let raw = decode_raw(bytes)?;
    let header = raw.header;
    let payload = serde_json::from_value(raw.payload)
        .map_err(|e| CodecError::PayloadMismatch(e.to_string()))?;
    Ok(Envelope { header, payload })
}
