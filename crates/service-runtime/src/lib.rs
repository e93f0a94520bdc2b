//! # Courier Service Runtime
//!
//! Wires the RPC client, dispatcher, idempotency service and dead-letter
//! escalation into one process serving two demo services:
//!
//! - `user.activate` / `user.lookup`: request/reply, answered by `user`
//! - `notification.send-email`: one-way command, consumed by `notification`
//!
//! ## Flow
//!
//! ```text
//! caller ──user.activate.request──► user ──reply──► user.reply.queue
//!                                     │
//!                                     └──notification.send-email.request──► notification
//!                                                                              │ failure
//!                                                       dlq ◄──────────────────┘
//!                                                        │
//!                                        retry (backoff) ┴ poison after max retries
//! ```

pub mod config;
pub mod handlers;
pub mod runtime;

pub use config::RuntimeConfig;
pub use runtime::{ServiceRuntime, NOTIFICATION_SERVICE};
