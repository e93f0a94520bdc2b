//! # Integration Flows
//!
//! Every test runs against a fresh in-process broker.

pub mod dead_letter_flow;
pub mod idempotency_flow;
pub mod rpc_flow;
