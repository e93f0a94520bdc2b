//! Broker-level message metadata.
//!
//! These travel next to the encoded envelope, never inside it: the envelope is
//! what services exchange, the properties are what the broker and the
//! reliability layer need to route, retry and quarantine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reject reason used for envelopes that could not be decoded.
/// Such messages are never retried.
pub const MALFORMED_REASON: &str = "malformed";

/// Why a message left its queue for the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeathReason {
    /// A consumer rejected it.
    Rejected(String),
    /// The queue's message TTL elapsed before delivery.
    Expired,
    /// Dropped from the head of a full queue.
    MaxLength,
}

impl DeathReason {
    /// True when the message itself is defective.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Rejected(reason) if reason.starts_with(MALFORMED_REASON))
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Expired => write!(f, "expired"),
            Self::MaxLength => write!(f, "maxlen"),
        }
    }
}

/// Metadata attached to every broker message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Broker-assigned identity, stable across redeliveries and retries.
    pub message_id: Uuid,

    /// Retry counter. 0 on first publish, incremented by each dead-letter retry.
    pub attempt: u32,

    /// Set when the broker hands out a message a consumer already saw.
    pub redelivered: bool,

    /// Queue the message was dead-lettered from.
    pub origin_queue: Option<String>,

    /// Routing key the message was first published with.
    pub origin_routing_key: Option<String>,

    pub death_reason: Option<DeathReason>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            attempt: 0,
            redelivered: false,
            origin_queue: None,
            origin_routing_key: None,
            death_reason: None,
        }
    }
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self::new()
    }
}
