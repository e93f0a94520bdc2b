//! # CR-04 Reliability
//!
//! Escalation path for messages a handler could not process:
//! dead-letter queue, bounded retries with backoff, then quarantine in
//! `poison.queue`.
//!
//! ## Retry accounting
//!
//! `MessageProperties::attempt` starts at 0 and is incremented on every
//! retry. With `max_retries = 3` a handler that always fails sees the message
//! four times (the first delivery plus three retries); the fourth failure is
//! poisoned and the main queue never sees it again.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod consumer;
pub mod error;
pub mod inspector;
pub mod policy;
pub mod record;
pub mod topology;

pub use consumer::DeadLetterConsumer;
pub use error::ReliabilityError;
pub use inspector::PoisonInspector;
pub use policy::RetryPolicy;
pub use record::{DeadLetterRecord, PoisonRecord};
pub use topology::{QueueTopology, POISON_TTL};
