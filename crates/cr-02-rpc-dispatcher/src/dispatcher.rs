//! # Dispatcher
//!
//! One consumer loop per binding. Each loop holds a semaphore of `prefetch`
//! permits; a delivery is only pulled once a permit is free, so at most
//! `prefetch` handler invocations run per queue.
//!
//! ## Per-delivery flow
//!
//! ```text
//! delivery ─► decode envelope ─┬─ malformed ──► reject("malformed")
//!                              └─ ok ─► handler (panics caught)
//!                                         │
//!                     Rpc ◄───────────────┴───────────────► Command
//!            reply on replyTo, ack                 Ok ─► ack, Err ─► reject
//! ```

use crate::error::{DispatchError, HandlerError};
use crate::handler::{RequestContext, RpcHandler};
use crate::registry::{BindingKind, HandlerRegistry};
use courier_telemetry::{DISPATCH_RESULTS, HANDLER_PANICS};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use shared_bus::{decode_raw, Consumer, Delivery, Message, Transport};
use shared_types::{Envelope, Header, ResponseEnvelope, RouteKey, MALFORMED_REASON};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of in-flight handler invocations per queue.
pub const DEFAULT_PREFETCH: usize = 16;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name stamped as `sourceService` on replies.
    pub service_name: String,
    /// Concurrent handler invocations per queue.
    pub prefetch: usize,
}

impl DispatcherConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

/// Serves every binding of a [`HandlerRegistry`] until shut down.
pub struct Dispatcher {
    service_name: String,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Declare and bind every queue, then start consuming.
    pub async fn start(
        transport: Arc<dyn Transport>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::with_capacity(registry.len());

        for binding in registry.into_bindings() {
            transport.declare_queue(binding.queue.clone()).await?;
            transport
                .bind(binding.queue_name(), &binding.routing_key)
                .await?;
            let consumer = transport.consume(binding.queue_name()).await?;

            info!(
                queue = %binding.queue_name(),
                routing_key = %binding.routing_key,
                kind = ?binding.kind,
                prefetch = config.prefetch,
                "Serving binding"
            );

            let worker = Arc::new(Worker {
                transport: Arc::clone(&transport),
                service_name: config.service_name.clone(),
                route: binding.route.clone(),
                kind: binding.kind,
                handler: Arc::clone(&binding.handler),
            });
            let channel = ChannelLoop {
                consumer,
                worker,
                permits: Arc::new(Semaphore::new(config.prefetch.max(1))),
                prefetch: config.prefetch.max(1),
                shutdown: shutdown_rx.clone(),
            };
            loops.push(tokio::spawn(channel.run()));
        }

        Ok(Self {
            service_name: config.service_name,
            shutdown_tx,
            loops: Mutex::new(loops),
        })
    }

    /// Stop consuming and wait for in-flight handlers to finish.
    ///
    /// Deliveries buffered but not yet started go back to their queues.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let loops: Vec<_> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer loop ended abnormally");
            }
        }
        info!(service = %self.service_name, "Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Consumer loop for one binding.
struct ChannelLoop {
    consumer: Consumer,
    worker: Arc<Worker>,
    permits: Arc<Semaphore>,
    prefetch: usize,
    shutdown: watch::Receiver<bool>,
}

impl ChannelLoop {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = self.shutdown.changed() => continue,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = self.shutdown.changed() => continue,
                delivery = self.consumer.next() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!(queue = %self.consumer.queue(), "Queue closed");
                        break;
                    }
                },
            };

            let worker = Arc::clone(&self.worker);
            tokio::spawn(async move {
                worker.process(delivery).await;
                drop(permit);
            });
        }

        // Every permit back means every handler finished
        let _ = self.permits.acquire_many(self.prefetch as u32).await;
        debug!(queue = %self.consumer.queue(), "Consumer loop drained");
    }
}

/// Per-binding processing shared by all in-flight deliveries.
struct Worker {
    transport: Arc<dyn Transport>,
    service_name: String,
    route: RouteKey,
    kind: BindingKind,
    handler: Arc<dyn RpcHandler>,
}

impl Worker {
    async fn process(&self, delivery: Delivery) {
        let message = delivery.message();
        let envelope = match decode_raw(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    route = %self.route,
                    message_id = %message.properties.message_id,
                    error = %e,
                    "Malformed request rejected"
                );
                DISPATCH_RESULTS.with_label_values(&["malformed"]).inc();
                delivery.reject(format!("{MALFORMED_REASON}: {e}"));
                return;
            }
        };

        let header = envelope.header;
        let ctx = RequestContext {
            header: header.clone(),
            route: self.route.clone(),
            message_id: message.properties.message_id,
            attempt: message.properties.attempt,
            redelivered: message.properties.redelivered,
        };

        debug!(
            correlation_id = %header.correlation_id,
            route = %self.route,
            attempt = ctx.attempt,
            redelivered = ctx.redelivered,
            "Dispatching request"
        );

        let result = self.invoke(ctx, envelope.payload).await;
        let code = match &result {
            Ok(_) => shared_types::codes::OK,
            Err(e) => e.code,
        };
        DISPATCH_RESULTS
            .with_label_values(&[code.to_string().as_str()])
            .inc();

        match self.kind {
            BindingKind::Rpc => {
                self.reply(&header, result).await;
                delivery.ack();
            }
            BindingKind::Command => match result {
                Ok(_) => delivery.ack(),
                Err(e) => {
                    warn!(
                        correlation_id = %header.correlation_id,
                        route = %self.route,
                        code = e.code,
                        error = %e.message,
                        "Command failed, rejecting to dead-letter path"
                    );
                    let reason = if e.is_permanent() {
                        format!("{MALFORMED_REASON}: {e}")
                    } else {
                        e.to_string()
                    };
                    delivery.reject(reason);
                }
            },
        }
    }

    /// Run the handler, turning a panic into a `500`.
    async fn invoke(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError> {
        let correlation_id = ctx.correlation_id();
        match AssertUnwindSafe(self.handler.handle(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                HANDLER_PANICS.inc();
                let message = panic_message(&panic);
                error!(
                    correlation_id = %correlation_id,
                    route = %self.route,
                    panic = %message,
                    "Handler panicked"
                );
                Err(HandlerError::internal(message))
            }
        }
    }

    async fn reply(&self, request: &Header, result: Result<Value, HandlerError>) {
        let response = match result {
            Ok(data) => ResponseEnvelope::success(data),
            Err(e) => ResponseEnvelope::error(e.code, e.message),
        };
        let header = request.reply(self.service_name.as_str(), response.status());
        let envelope = Envelope::new(header, response);
        let message = match Message::from_envelope(request.reply_to.as_str(), &envelope) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "Reply encoding failed"
                );
                return;
            }
        };

        // With a reply exchange the reply address is a routing key, otherwise a queue
        let sent = match &request.reply_exchange {
            Some(_) => self
                .transport
                .publish(&request.reply_to, message)
                .await
                .map(|_| ()),
            None => self.transport.send_to_queue(&request.reply_to, message).await,
        };

        match sent {
            Ok(()) => debug!(
                correlation_id = %request.correlation_id,
                reply_to = %request.reply_to,
                "Reply sent"
            ),
            // The caller will time out; re-running the handler would not help
            Err(e) => error!(
                correlation_id = %request.correlation_id,
                reply_to = %request.reply_to,
                error = %e,
                "Reply could not be delivered"
            ),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
