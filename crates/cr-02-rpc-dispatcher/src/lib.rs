//! # CR-02 RPC Dispatcher
//!
//! Server side of request/reply: consumes request queues, runs the registered
//! handler, and answers on the caller's reply address.
//!
//! ## Guarantees
//!
//! - An `Rpc` binding always replies, with the request's correlation ID, and
//!   only then acks. Handler errors and panics become error replies.
//! - A `Command` binding never replies. Failures are rejected to the
//!   dead-letter path for retry or quarantine.
//! - An undecodable envelope is rejected with reason `malformed` and is never
//!   retried.
//! - Delivery is at-least-once; the same request may reach a handler twice.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod registry;

pub use dispatcher::{Dispatcher, DispatcherConfig, DEFAULT_PREFETCH};
pub use error::{DispatchError, HandlerError};
pub use handler::{handler_fn, RequestContext, RpcHandler};
pub use registry::{Binding, BindingKind, HandlerRegistry};
