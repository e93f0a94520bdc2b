//! Error types for idempotency operations.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// The backing store could not be reached or answered garbage.
    #[error("Idempotency store error: {0}")]
    Store(String),

    /// Another worker holds the claim and did not finish in time.
    #[error("Key {key} still processing after {waited_ms} ms")]
    StillProcessing { key: String, waited_ms: u64 },

    /// A recorded result no longer fits the caller's type.
    #[error("Cached result for {key} could not be decoded: {reason}")]
    Decode { key: String, reason: String },

    /// The caller's result could not be serialized for recording.
    #[error("Result for {key} could not be encoded: {reason}")]
    Encode { key: String, reason: String },
}
