//! Dead-letter and poison records.

use serde::{Deserialize, Serialize};
use shared_bus::Message;
use shared_types::{now_millis, DeathReason};
use uuid::Uuid;

/// What the dead-letter consumer knows about a failed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub message_id: Uuid,
    /// Routing key of the original publish.
    pub routing_key: String,
    pub origin_queue: Option<String>,
    pub reason: Option<DeathReason>,
    /// Retries already made.
    pub attempts: u32,
}

impl DeadLetterRecord {
    pub fn from_message(message: &Message) -> Self {
        let properties = &message.properties;
        Self {
            message_id: properties.message_id,
            routing_key: message.original_routing_key().to_string(),
            origin_queue: properties.origin_queue.clone(),
            reason: properties.death_reason.clone(),
            attempts: properties.attempt,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.reason.as_ref().is_some_and(DeathReason::is_malformed)
    }
}

/// A quarantined message. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoisonRecord {
    #[serde(flatten)]
    pub dead_letter: DeadLetterRecord,
    /// Original encoded envelope, lossily decoded as UTF-8.
    pub body: String,
    /// Epoch millis.
    pub poisoned_at: i64,
}

impl PoisonRecord {
    pub fn from_message(message: &Message) -> Self {
        Self {
            dead_letter: DeadLetterRecord::from_message(message),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            poisoned_at: now_millis(),
        }
    }

    pub fn reason(&self) -> Option<&DeathReason> {
        self.dead_letter.reason.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.dead_letter.attempts
    }
}
