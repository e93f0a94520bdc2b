//! # Routing Conventions
//!
//! | Name | Pattern |
//! |------|---------|
//! | Request routing key | `<domain>.<action>.request` |
//! | Consumer queue | `<domain>.<action>.<consumer-service>.queue` |
//! | Reply queue | `<service>.reply.queue` |
//! | Dead-letter routing key | `dlq.<domain>.<action>` |
//! | Dead-letter queue | `<domain>.<action>.dlq` |
//! | Poison routing key | `poison.<domain>.<action>` |
//! | Poison queue | `poison.queue`, bound on `poison.#` |

use crate::errors::RouteError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shared terminal holding area for exhausted messages.
pub const POISON_QUEUE: &str = "poison.queue";

/// Binding pattern of [`POISON_QUEUE`].
pub const POISON_BINDING: &str = "poison.#";

/// Durable per-service reply queue name.
pub fn reply_queue(service: &str) -> String {
    format!("{service}.reply.queue")
}

/// A `(domain, action)` command destination.
///
/// The domain doubles as the target service name in request headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    domain: String,
    action: String,
}

impl RouteKey {
    pub fn new(domain: impl Into<String>, action: impl Into<String>) -> Result<Self, RouteError> {
        let domain = domain.into();
        let action = action.into();
        validate_word(&domain)?;
        validate_word(&action)?;
        Ok(Self { domain, action })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn target_service(&self) -> &str {
        &self.domain
    }

    pub fn request_key(&self) -> String {
        format!("{}.{}.request", self.domain, self.action)
    }

    pub fn consumer_queue(&self, consumer_service: &str) -> String {
        format!("{}.{}.{}.queue", self.domain, self.action, consumer_service)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("dlq.{}.{}", self.domain, self.action)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.{}.dlq", self.domain, self.action)
    }

    pub fn poison_key(&self) -> String {
        format!("poison.{}.{}", self.domain, self.action)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.action)
    }
}

fn validate_word(word: &str) -> Result<(), RouteError> {
    let bad = word.is_empty()
        || word
            .chars()
            .any(|c| c == '.' || c == '*' || c == '#' || c.is_whitespace());
    if bad {
        return Err(RouteError::InvalidWord(word.to_string()));
    }
    Ok(())
}
