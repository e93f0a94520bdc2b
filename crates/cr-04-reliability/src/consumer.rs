//! # Dead-Letter Consumer
//!
//! Drains `<domain>.<action>.dlq`. For each message:
//!
//! - reason `malformed`, or retries used up: publish a [`PoisonRecord`] to
//!   `poison.<domain>.<action>` and ack
//! - otherwise: wait `delay_for(attempt)`, send the original message back to
//!   the queue it died in with `attempt + 1`, then ack
//!
//! Waits run in their own tasks so one backoff never holds up other dead
//! letters. The dead-letter delivery stays unsettled until the retry is sent,
//! so a crash mid-wait redelivers it instead of losing it.

use crate::error::ReliabilityError;
use crate::policy::RetryPolicy;
use crate::record::{DeadLetterRecord, PoisonRecord};
use crate::topology::QueueTopology;
use courier_telemetry::{DEAD_LETTERS, POISONED, RETRIES};
use shared_bus::{Consumer, Delivery, Message, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running dead-letter consumer.
pub struct DeadLetterConsumer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DeadLetterConsumer {
    /// Start consuming the topology's dead-letter queue.
    ///
    /// The topology must already be declared.
    pub async fn spawn(
        transport: Arc<dyn Transport>,
        topology: QueueTopology,
        policy: RetryPolicy,
    ) -> Result<Self, ReliabilityError> {
        let consumer = transport.consume(topology.dead_letter_queue()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            route = %topology.route,
            queue = %topology.dead_letter_queue(),
            max_retries = policy.max_retries,
            "Dead-letter consumer started"
        );

        let escalator = Arc::new(Escalator {
            transport,
            topology,
            policy,
        });
        let handle = tokio::spawn(run(consumer, escalator, shutdown_rx));
        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Stop taking new dead letters. Retries already waiting still complete.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Dead-letter consumer ended abnormally");
        }
    }
}

async fn run(mut consumer: Consumer, escalator: Arc<Escalator>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = consumer.next() => match delivery {
                Some(delivery) => escalator.handle(delivery).await,
                None => break,
            }
        }
    }
    debug!(queue = %consumer.queue(), "Dead-letter consumer stopped");
}

struct Escalator {
    transport: Arc<dyn Transport>,
    topology: QueueTopology,
    policy: RetryPolicy,
}

impl Escalator {
    async fn handle(self: &Arc<Self>, delivery: Delivery) {
        let record = DeadLetterRecord::from_message(delivery.message());
        let route = self.topology.route.to_string();
        DEAD_LETTERS.with_label_values(&[route.as_str()]).inc();

        if record.is_malformed() || self.policy.is_exhausted(record.attempts) {
            self.poison(delivery, &record).await;
            return;
        }

        let escalator = Arc::clone(self);
        tokio::spawn(async move {
            escalator.retry(delivery, record).await;
        });
    }

    async fn retry(&self, delivery: Delivery, record: DeadLetterRecord) {
        let delay = self.policy.delay_for(record.attempts);
        debug!(
            message_id = %record.message_id,
            route = %self.topology.route,
            attempt = record.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        tokio::time::sleep(delay).await;

        let mut message = delivery.message().clone();
        message.properties.attempt = record.attempts + 1;
        message.properties.death_reason = None;
        message.properties.redelivered = false;
        message.routing_key = record.routing_key.clone();

        let target = record
            .origin_queue
            .clone()
            .unwrap_or_else(|| self.topology.main_queue().to_string());

        match self.transport.send_to_queue(&target, message).await {
            Ok(()) => {
                RETRIES
                    .with_label_values(&[self.topology.route.to_string().as_str()])
                    .inc();
                info!(
                    message_id = %record.message_id,
                    queue = %target,
                    attempt = record.attempts + 1,
                    "Message sent back for retry"
                );
                delivery.ack();
            }
            // Dropping the delivery puts it back on the dead-letter queue
            Err(e) => warn!(
                message_id = %record.message_id,
                queue = %target,
                error = %e,
                "Retry could not be sent"
            ),
        }
    }

    async fn poison(&self, delivery: Delivery, record: &DeadLetterRecord) {
        let poison = PoisonRecord::from_message(delivery.message());
        let body = match serde_json::to_vec(&poison) {
            Ok(body) => body,
            Err(e) => {
                error!(message_id = %record.message_id, error = %e, "Poison record encoding failed");
                return;
            }
        };

        let mut message = Message::new(self.topology.route.poison_key(), body);
        message.properties = delivery.message().properties.clone();

        match self
            .transport
            .publish(&self.topology.route.poison_key(), message)
            .await
        {
            Ok(routed) => {
                if routed == 0 {
                    error!(
                        message_id = %record.message_id,
                        poison_key = %self.topology.route.poison_key(),
                        "Poison key is unroutable, message dropped"
                    );
                }
                POISONED
                    .with_label_values(&[self.topology.route.to_string().as_str()])
                    .inc();
                warn!(
                    message_id = %record.message_id,
                    route = %self.topology.route,
                    attempts = record.attempts,
                    reason = ?record.reason,
                    "Message poisoned"
                );
                delivery.ack();
            }
            Err(e) => warn!(
                message_id = %record.message_id,
                error = %e,
                "Poison publish failed"
            ),
        }
    }
}
