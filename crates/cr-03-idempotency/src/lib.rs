//! # CR-03 Idempotency
//!
//! Suppresses duplicate side effects under at-least-once delivery.
//!
//! ## Key states
//!
//! ```text
//!  (absent) ──claim_first──► Processing ──record_result──► Completed  (success_ttl)
//!     ▲                          │      └─record_failure─► Failed     (failure_ttl)
//!     └── processing_ttl/release ┘
//! ```
//!
//! Terminal states are never overwritten; reads return the same value until
//! the entry expires.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod service;
pub mod store;

pub use error::IdempotencyError;
pub use service::{IdempotencyConfig, IdempotencyService, Outcome, KEY_NAMESPACE};
pub use store::{IdempotencyState, IdempotencyStore, InMemoryIdempotencyStore};
