//! Handler trait and typed adapters.

use crate::error::HandlerError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_types::{CorrelationId, Header, RouteKey};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a handler knows about the request it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Header of the incoming request.
    pub header: Header,

    pub route: RouteKey,

    /// Broker identity of the message, stable across redeliveries and retries.
    pub message_id: Uuid,

    /// Retry attempt (0 on first delivery).
    pub attempt: u32,

    /// The broker already handed this message to a consumer once.
    pub redelivered: bool,
}

impl RequestContext {
    pub fn correlation_id(&self) -> CorrelationId {
        self.header.correlation_id
    }

    /// Absolute deadline propagated by the caller, epoch millis.
    pub fn deadline(&self) -> Option<i64> {
        self.header.deadline
    }

    /// Time left before the caller gives up. `Some(ZERO)` once it passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.header
            .remaining_ms()
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
    }
}

/// Business logic behind one binding.
///
/// Handlers must tolerate being invoked more than once for the same request;
/// guard side effects with the idempotency service.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter from a typed async closure.
struct FnHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> RpcHandler for FnHandler<F, Req, Resp>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| HandlerError::bad_request(format!("invalid payload: {e}")))?;
        let response = (self.f)(ctx, request).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::internal(format!("response encoding failed: {e}")))
    }
}

/// Wrap a typed async function as a handler.
///
/// A payload that does not deserialize into `Req` is answered with `400`
/// without calling `f`.
///
/// ```rust,ignore
/// let handler = handler_fn(|_ctx, req: ActivateUser| async move {
///     Ok(Activated { email: req.email, active: true })
/// });
/// ```
pub fn handler_fn<F, Fut, Req, Resp>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _types: PhantomData,
    })
}
