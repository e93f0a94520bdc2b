//! # Shared Bus - Broker Transport for Courier
//!
//! Publishes messages to routing destinations and delivers messages pushed to
//! named queues. There are no RPC semantics at this layer.
//!
//! ## Delivery Model
//!
//! ```text
//! publish(routing_key) ──► [bindings] ──► queue A ──► Consumer ──► Delivery
//!                                    └──► queue B        │
//!                                                        ├─ ack()     settled
//!                                                        ├─ reject()  ──► dead-letter key
//!                                                        └─ (dropped) ──► requeued, redelivered
//! ```
//!
//! - **At-least-once:** a delivery that is never settled goes back to the head
//!   of its queue and is handed out again with `redelivered = true`.
//! - **Dead-lettering:** rejected, expired (queue TTL) and overflowed (max
//!   length, drop-head) messages are republished with the queue's dead-letter
//!   routing key, or dropped with a warning when the queue declares none.
//! - **Topic bindings:** `*` matches one word, `#` matches zero or more.
//!
//! `InMemoryBroker` is a single-process implementation; a networked broker
//! client plugs in behind the same [`Transport`] trait.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod broker;
pub mod codec;
pub mod delivery;
pub mod message;
pub mod topic;
pub mod transport;

// Re-export main types
pub use broker::InMemoryBroker;
pub use codec::{decode, decode_raw, encode, CodecError, RawEnvelope};
pub use delivery::{Consumer, Delivery, Settle};
pub use message::{Message, QueueSpec};
pub use topic::topic_matches;
pub use transport::{Transport, TransportError};

/// Deliveries buffered per consumer ahead of the handler.
pub const DEFAULT_CONSUMER_BUFFER: usize = 1;
