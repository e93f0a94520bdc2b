//! # Transport
//!
//! The seam between Courier and a concrete broker.

use crate::delivery::Consumer;
use crate::message::{Message, QueueSpec};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from transport operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The queue was never declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The broker connection is closed.
    #[error("Transport closed")]
    Closed,

    /// The broker refused the operation.
    #[error("Transport rejected operation: {0}")]
    Rejected(String),
}

/// Publish/consume interface of a message broker.
///
/// Implementations are at-least-once: a consumer may see the same message
/// more than once and must tolerate it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare a queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), TransportError>;

    /// Bind a queue to a topic pattern.
    async fn bind(&self, queue: &str, pattern: &str) -> Result<(), TransportError>;

    /// Publish to every queue bound to `routing_key`.
    ///
    /// # Returns
    ///
    /// The number of queues the message was routed to. Zero is not an error.
    async fn publish(&self, routing_key: &str, message: Message) -> Result<usize, TransportError>;

    /// Enqueue directly on a named queue, bypassing bindings.
    async fn send_to_queue(&self, queue: &str, message: Message) -> Result<(), TransportError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError>;

    /// Number of ready (undelivered) messages.
    async fn queue_depth(&self, queue: &str) -> Result<usize, TransportError>;

    /// Snapshot of ready messages without consuming them.
    async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError>;
}
