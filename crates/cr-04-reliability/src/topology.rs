//! Queue layout for one route.
//!
//! ```text
//! <d>.<a>.request ──► <d>.<a>.<consumer>.queue ──(reject/ttl/maxlen)──► dlq.<d>.<a>
//!                                                                          │
//!                                                      <d>.<a>.dlq ◄───────┘
//!                                                          │
//!                                   retry (attempt + 1) ◄──┴──► poison.<d>.<a> ──► poison.queue
//! ```

use crate::error::ReliabilityError;
use shared_bus::{QueueSpec, Transport};
use shared_types::{RouteKey, POISON_BINDING, POISON_QUEUE};
use std::time::Duration;
use tracing::debug;

/// Retention of quarantined messages.
pub const POISON_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Queues and bindings backing one consumer of one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub route: RouteKey,
    /// Main consumer queue, dead-lettering to `dlq.<domain>.<action>`.
    pub main: QueueSpec,
    pub dead_letter: QueueSpec,
    pub poison: QueueSpec,
}

impl QueueTopology {
    pub fn for_route(route: &RouteKey, consumer_service: &str) -> Self {
        Self {
            route: route.clone(),
            main: QueueSpec::new(route.consumer_queue(consumer_service))
                .with_dead_letter(route.dead_letter_key()),
            dead_letter: QueueSpec::new(route.dead_letter_queue()),
            poison: QueueSpec::new(POISON_QUEUE).with_message_ttl(POISON_TTL),
        }
    }

    /// Dead-letter main-queue messages that wait longer than `ttl`.
    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.main = self.main.with_message_ttl(ttl);
        self
    }

    /// Bound the main queue; overflow dead-letters the oldest message.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.main = self.main.with_max_length(max_length);
        self
    }

    pub fn main_queue(&self) -> &str {
        &self.main.name
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter.name
    }

    /// Declare every queue and binding. Safe to repeat.
    ///
    /// Run this before a dispatcher declares the same main queue, so the
    /// TTL and length bound are in place.
    pub async fn declare(&self, transport: &dyn Transport) -> Result<(), ReliabilityError> {
        transport.declare_queue(self.poison.clone()).await?;
        transport.bind(&self.poison.name, POISON_BINDING).await?;

        transport.declare_queue(self.dead_letter.clone()).await?;
        transport
            .bind(&self.dead_letter.name, &self.route.dead_letter_key())
            .await?;

        transport.declare_queue(self.main.clone()).await?;
        transport
            .bind(&self.main.name, &self.route.request_key())
            .await?;

        debug!(
            route = %self.route,
            main = %self.main.name,
            dead_letter = %self.dead_letter.name,
            "Declared queue topology"
        );
        Ok(())
    }
}
