//! Error types for RPC calls.

use shared_bus::TransportError;
use shared_types::CorrelationId;
use thiserror::Error;

/// Terminal failure of one RPC call.
///
/// Every call ends in exactly one `Ok(T)` or exactly one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No reply within the deadline. The remote handler may still be running.
    #[error("Call to {target} ({route}) timed out after {elapsed_ms} ms")]
    Timeout {
        target: String,
        route: String,
        elapsed_ms: u64,
    },

    /// Well-formed non-success reply. Never retried automatically.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// Publish or connection failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or type-mismatched payload. A defect, never retried.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// Short label used for the outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Remote { .. } => "remote_error",
            Self::Transport(_) => "transport_error",
            Self::Decode(_) => "decode_error",
        }
    }
}

/// Errors from the correlation registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Correlation ID {0} is already outstanding")]
    Duplicate(CorrelationId),
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        RpcError::Transport(TransportError::Rejected(e.to_string()))
    }
}
