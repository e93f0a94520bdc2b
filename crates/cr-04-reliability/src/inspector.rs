//! Operator view of the poison queue.

use crate::error::ReliabilityError;
use crate::record::PoisonRecord;
use shared_bus::Transport;
use shared_types::POISON_QUEUE;
use tracing::warn;

/// Read-only access to quarantined messages.
///
/// Nothing here moves or retries a message; that is an operator decision.
pub struct PoisonInspector;

impl PoisonInspector {
    /// Decode every message waiting in `poison.queue`, oldest first.
    pub async fn list(transport: &dyn Transport) -> Result<Vec<PoisonRecord>, ReliabilityError> {
        let messages = transport.peek(POISON_QUEUE).await?;
        let mut records = Vec::with_capacity(messages.len());
        for message in messages {
            match serde_json::from_slice::<PoisonRecord>(&message.body) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    message_id = %message.properties.message_id,
                    error = %e,
                    "Poison queue entry is not a poison record"
                ),
            }
        }
        Ok(records)
    }

    pub async fn count(transport: &dyn Transport) -> Result<usize, ReliabilityError> {
        Ok(transport.queue_depth(POISON_QUEUE).await?)
    }
}
