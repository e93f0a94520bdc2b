//! # Deliveries
//!
//! The consuming side of a queue.

use crate::message::Message;
use shared_types::DeathReason;
use tokio::sync::mpsc;
use tracing::debug;

/// Settlement hooks a transport installs on each delivery.
pub trait Settle: Send + Sync {
    /// The consumer finished with the message.
    fn ack(&self, message: &Message);

    /// The consumer gave up on the message.
    fn reject(&self, message: Message, reason: DeathReason);

    /// The delivery was dropped unsettled; hand it out again.
    fn requeue(&self, message: Message);
}

/// A message handed to a consumer.
///
/// Must be settled with [`ack`](Self::ack) or [`reject`](Self::reject). A
/// delivery dropped without settlement is requeued.
pub struct Delivery {
    message: Option<Message>,
    settler: std::sync::Arc<dyn Settle>,
}

impl Delivery {
    pub fn new(message: Message, settler: std::sync::Arc<dyn Settle>) -> Self {
        Self {
            message: Some(message),
            settler,
        }
    }

    /// The delivered message.
    ///
    /// Only settlement takes the message out, and settlement consumes `self`.
    pub fn message(&self) -> &Message {
        match &self.message {
            Some(message) => message,
            None => unreachable!("delivery message is present until settled"),
        }
    }

    pub fn ack(mut self) {
        if let Some(message) = self.message.take() {
            self.settler.ack(&message);
        }
    }

    /// Reject to the dead-letter path.
    pub fn reject(mut self, reason: impl Into<String>) {
        if let Some(message) = self.message.take() {
            self.settler.reject(message, DeathReason::Rejected(reason.into()));
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            debug!(
                message_id = %message.properties.message_id,
                routing_key = %message.routing_key,
                "Delivery dropped unsettled, requeueing"
            );
            self.settler.requeue(message);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish()
    }
}

/// Stream of deliveries from one queue.
///
/// When dropped, buffered deliveries are requeued.
pub struct Consumer {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(queue: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    /// Receive the next delivery.
    ///
    /// # Returns
    ///
    /// - `Some(delivery)` - The next message
    /// - `None` - The transport closed
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}
