//! # Error Types
//!
//! Errors raised while interpreting routing names.

use thiserror::Error;

/// Errors parsing or building routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// A domain/action word is empty or contains a separator or wildcard.
    #[error("Invalid routing word: {0:?}")]
    InvalidWord(String),
}
