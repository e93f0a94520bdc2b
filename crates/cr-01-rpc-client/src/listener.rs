//! Shared reply listener.
//!
//! One consumer per client on `<service>.reply.queue`. Every reply is matched
//! against the registry by correlation ID; anything that matches nothing (late,
//! duplicate, or foreign) is logged and dropped. Replies are always acked so a
//! stray message can never wedge the queue.

use crate::registry::CorrelationRegistry;
use courier_telemetry::RPC_DISCARDED_REPLIES;
use shared_bus::{decode_raw, Consumer, Delivery};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) struct ReplyListener {
    consumer: Consumer,
    registry: Arc<CorrelationRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl ReplyListener {
    pub(crate) fn new(
        consumer: Consumer,
        registry: Arc<CorrelationRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            registry,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(queue = %self.consumer.queue(), "Reply listener started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                delivery = self.consumer.next() => match delivery {
                    Some(delivery) => self.handle(delivery),
                    None => {
                        warn!(queue = %self.consumer.queue(), "Reply queue closed");
                        break;
                    }
                }
            }
        }

        info!(queue = %self.consumer.queue(), "Reply listener stopped");
    }

    fn handle(&self, delivery: Delivery) {
        let reply = match decode_raw(&delivery.message().body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    queue = %self.consumer.queue(),
                    error = %e,
                    "Undecodable reply discarded"
                );
                RPC_DISCARDED_REPLIES.inc();
                delivery.ack();
                return;
            }
        };

        let correlation_id = reply.header.correlation_id;
        if !self.registry.complete(correlation_id, reply) {
            RPC_DISCARDED_REPLIES.inc();
            debug!(
                correlation_id = %correlation_id,
                "Late or unknown reply discarded"
            );
        }
        delivery.ack();
    }
}
