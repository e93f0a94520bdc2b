//! Broker messages and queue declarations.

use crate::codec::{self, CodecError};
use bytes::Bytes;
use serde::Serialize;
use shared_types::{Envelope, MessageProperties};
use std::time::Duration;

/// A message as the broker sees it: opaque body plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Routing key of the most recent publish.
    pub routing_key: String,

    /// Encoded envelope.
    pub body: Bytes,

    pub properties: MessageProperties,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            properties: MessageProperties::new(),
        }
    }

    /// Encode an envelope into a fresh message.
    pub fn from_envelope<T: Serialize>(
        routing_key: impl Into<String>,
        envelope: &Envelope<T>,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(routing_key, codec::encode(envelope)?))
    }

    /// Routing key the message was first published with.
    pub fn original_routing_key(&self) -> &str {
        self.properties
            .origin_routing_key
            .as_deref()
            .unwrap_or(&self.routing_key)
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,

    /// Routing key used when a message leaves this queue for the dead-letter path.
    pub dead_letter_routing_key: Option<String>,

    /// Messages older than this when they reach the head are dead-lettered.
    pub message_ttl: Option<Duration>,

    /// Maximum ready messages; on overflow the oldest is dead-lettered.
    pub max_length: Option<usize>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}
