//! Error types for the dispatcher.

use shared_bus::TransportError;
use shared_types::codes;
use std::fmt;
use thiserror::Error;

/// Failure returned by a handler. Becomes the `{code, message}` of the reply.
///
/// Any `std::error::Error` converts into a `500`, so handlers can use `?` on
/// their own errors. For that reason this type does not implement
/// `std::error::Error` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: i32,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(codes::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Bad input is not worth retrying.
    pub fn is_permanent(&self) -> bool {
        self.code == codes::BAD_REQUEST
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::internal(e.to_string())
    }
}

/// Errors from setting up or running a dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue {0} already has a handler")]
    DuplicateQueue(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
