//! Error types for the reliability layer.

use shared_bus::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReliabilityError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Poison record could not be encoded: {0}")]
    Encode(String),
}
