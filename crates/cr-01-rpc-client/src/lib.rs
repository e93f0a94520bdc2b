//! # CR-01 RPC Client
//!
//! Synchronous-looking request/reply over an asynchronous broker.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► RpcClient::call ──► register(id) ──► publish <domain>.<action>.request
//!                 ▲                   │
//!                 │            CorrelationRegistry
//!                 │                   ▲
//!            reply | timeout          │ complete(id)
//!                 │                   │
//!                 └────────── ReplyListener ◄── <service>.reply.queue
//! ```
//!
//! Every call ends in exactly one outcome: a decoded result, or one of
//! [`RpcError`]'s `Timeout`, `Remote`, `Transport` or `Decode`. A reply that
//! arrives after its call timed out is discarded.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod client;
pub mod error;
mod listener;
pub mod registry;

pub use client::{ClientConfig, PublishRetry, RpcClient, DEFAULT_CALL_TIMEOUT};
pub use error::{RegistryError, RpcError};
pub use registry::{CorrelationRegistry, PendingHandle, RegistryStats, Reply};
