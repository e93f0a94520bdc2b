//! # RPC Client
//!
//! Turns a publish plus an asynchronously arriving reply into one awaitable
//! call with a deadline.
//!
//! ## Call lifecycle
//!
//! 1. Fresh `CorrelationId`, registered **before** the request is published
//! 2. Request published on `<domain>.<action>.request` with `replyTo` set to
//!    this service's reply queue
//! 3. Whichever comes first wins: the reply listener completing the entry, or
//!    the deadline abandoning it
//! 4. The reply is interpreted: non-success status or code is `Remote`,
//!    otherwise `data` is decoded into the caller's type

use crate::error::RpcError;
use crate::listener::ReplyListener;
use crate::registry::{CorrelationRegistry, Reply};
use courier_telemetry::{RPC_CALLS, RPC_CALL_DURATION};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_bus::{Message, QueueSpec, Transport, TransportError};
use shared_types::{
    now_millis, reply_queue, CorrelationId, Envelope, Header, ReplyStatus, ResponseEnvelope,
    RouteKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry schedule for publishing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishRetry {
    /// Total publish attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for PublishRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name of the calling service. Also names the reply queue.
    pub service_name: String,
    pub default_timeout: Duration,
    pub publish_retry: PublishRetry,
}

impl ClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            publish_retry: PublishRetry::default(),
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_publish_retry(mut self, retry: PublishRetry) -> Self {
        self.publish_retry = retry;
        self
    }
}

/// Request/reply client bound to one service's reply queue.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    registry: Arc<CorrelationRegistry>,
    config: ClientConfig,
    reply_queue: String,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Declare the reply queue and start the shared reply listener.
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self, RpcError> {
        let reply_queue = reply_queue(&config.service_name);
        transport
            .declare_queue(QueueSpec::new(reply_queue.clone()))
            .await?;
        let consumer = transport.consume(&reply_queue).await?;

        let registry = Arc::new(CorrelationRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ReplyListener::new(consumer, Arc::clone(&registry), shutdown_rx);
        let handle = tokio::spawn(listener.run());

        info!(
            service = %config.service_name,
            reply_queue = %reply_queue,
            default_timeout_ms = config.default_timeout.as_millis() as u64,
            "RPC client started"
        );

        Ok(Self {
            transport,
            registry,
            config,
            reply_queue,
            shutdown_tx,
            listener: Mutex::new(Some(handle)),
        })
    }

    /// Call `route` and wait for its reply.
    ///
    /// `timeout` falls back to the configured default. The outgoing request
    /// carries `now + timeout` as its deadline.
    pub async fn call<Req, Resp>(
        &self,
        route: &RouteKey,
        payload: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        self.execute(route, payload, timeout).await
    }

    /// Call `route` on behalf of a request being handled.
    ///
    /// The effective timeout is the smaller of `timeout` and what is left of
    /// the parent's deadline. A spent budget fails with `Timeout` without
    /// publishing.
    pub async fn call_with_context<Req, Resp>(
        &self,
        parent: &Header,
        route: &RouteKey,
        payload: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut timeout = timeout.unwrap_or(self.config.default_timeout);

        if let Some(remaining) = parent.remaining_ms() {
            if remaining <= 0 {
                debug!(
                    parent = %parent.correlation_id,
                    route = %route,
                    "Deadline already spent, not publishing"
                );
                let err = RpcError::Timeout {
                    target: route.target_service().to_string(),
                    route: route.to_string(),
                    elapsed_ms: 0,
                };
                RPC_CALLS.with_label_values(&[err.outcome()]).inc();
                return Err(err);
            }
            timeout = timeout.min(Duration::from_millis(remaining as u64));
        }

        self.execute(route, payload, timeout).await
    }

    /// Publish a one-way command. Nothing is registered and no reply is awaited.
    pub async fn send<Req>(&self, route: &RouteKey, payload: &Req) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let header = Header::request(
            CorrelationId::new(),
            self.reply_queue.as_str(),
            self.config.service_name.as_str(),
            route.target_service(),
        );
        let request_key = route.request_key();
        let message = Message::from_envelope(request_key.as_str(), &Envelope::new(header, payload))
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        self.publish_with_retry(&request_key, message).await?;
        debug!(route = %route, "Command published");
        Ok(())
    }

    async fn execute<Req, Resp>(
        &self,
        route: &RouteKey,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let started = Instant::now();
        let result = self
            .round_trip(route, payload, timeout, started)
            .await
            .and_then(|reply| interpret(route, reply));

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        RPC_CALLS.with_label_values(&[outcome]).inc();
        RPC_CALL_DURATION.observe(started.elapsed().as_secs_f64());
        result
    }

    /// Register, publish and wait. Returns the raw reply.
    async fn round_trip<Req>(
        &self,
        route: &RouteKey,
        payload: &Req,
        timeout: Duration,
        started: Instant,
    ) -> Result<Reply, RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let correlation_id = CorrelationId::new();
        let mut pending = self.registry.register(correlation_id, route)?;

        let header = Header::request(
            correlation_id,
            self.reply_queue.as_str(),
            self.config.service_name.as_str(),
            route.target_service(),
        )
        .with_deadline(now_millis() + timeout.as_millis() as i64);
        let request_key = route.request_key();
        let message = Message::from_envelope(request_key.as_str(), &Envelope::new(header, payload))
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        // Dropping `pending` on error removes the registry entry
        self.publish_with_retry(&request_key, message).await?;

        debug!(
            correlation_id = %correlation_id,
            route = %route,
            timeout_ms = timeout.as_millis() as u64,
            "Request published"
        );

        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped without a reply: the client is shutting down
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => {
                if self.registry.abandon(&correlation_id) {
                    return Err(RpcError::Timeout {
                        target: route.target_service().to_string(),
                        route: route.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                // The reply won the race; it is already on its way
                pending
                    .wait()
                    .await
                    .map_err(|_| RpcError::Transport(TransportError::Closed))
            }
        }
    }

    async fn publish_with_retry(&self, routing_key: &str, message: Message) -> Result<(), RpcError> {
        let retry = self.config.publish_retry;
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.transport.publish(routing_key, message.clone()).await {
                Ok(0) => {
                    warn!(routing_key = %routing_key, "No queue bound for request");
                    return Err(TransportError::Rejected(format!("no route for {routing_key}")).into());
                }
                Ok(_) => return Ok(()),
                Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                Err(e) if attempt < attempts => {
                    warn!(
                        routing_key = %routing_key,
                        attempt,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(retry.backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop the reply listener and fail every outstanding call with `Closed`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let failed = self.registry.fail_all();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(
            service = %self.config.service_name,
            failed_calls = failed,
            "RPC client stopped"
        );
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Map a reply onto the caller's result type.
fn interpret<Resp: DeserializeOwned>(route: &RouteKey, reply: Reply) -> Result<Resp, RpcError> {
    let correlation_id = reply.header.correlation_id;
    let response: ResponseEnvelope<Value> = serde_json::from_value(reply.payload)
        .map_err(|e| RpcError::Decode(format!("reply is not a response envelope: {e}")))?;

    if reply.header.status == Some(ReplyStatus::Error) || !response.is_success() {
        debug!(
            correlation_id = %correlation_id,
            route = %route,
            code = response.code,
            "Remote error"
        );
        return Err(RpcError::Remote {
            code: response.code,
            message: response.message,
        });
    }

    serde_json::from_value(response.data.unwrap_or(Value::Null))
        .map_err(|e| RpcError::Decode(format!("reply data does not match expected type: {e}")))
}
