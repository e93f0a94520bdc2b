//! Registration table: which handler serves which queue.

use crate::error::DispatchError;
use crate::handler::RpcHandler;
use shared_bus::QueueSpec;
use shared_types::RouteKey;
use std::collections::HashSet;
use std::sync::Arc;

/// How a binding answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Always replies on `replyTo`, then acks.
    Rpc,
    /// One-way. Success acks; failure rejects to the dead-letter path.
    Command,
}

/// One consumer queue and the handler behind it.
#[derive(Clone)]
pub struct Binding {
    pub route: RouteKey,
    pub queue: QueueSpec,
    pub routing_key: String,
    pub kind: BindingKind,
    pub handler: Arc<dyn RpcHandler>,
}

impl Binding {
    /// `<domain>.<action>.<consumer>.queue` bound on `<domain>.<action>.request`,
    /// dead-lettering to `dlq.<domain>.<action>`.
    pub fn rpc(route: RouteKey, consumer_service: &str, handler: Arc<dyn RpcHandler>) -> Self {
        Self::new(route, consumer_service, BindingKind::Rpc, handler)
    }

    pub fn command(route: RouteKey, consumer_service: &str, handler: Arc<dyn RpcHandler>) -> Self {
        Self::new(route, consumer_service, BindingKind::Command, handler)
    }

    fn new(
        route: RouteKey,
        consumer_service: &str,
        kind: BindingKind,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let queue = QueueSpec::new(route.consumer_queue(consumer_service))
            .with_dead_letter(route.dead_letter_key());
        Self {
            routing_key: route.request_key(),
            route,
            queue,
            kind,
            handler,
        }
    }

    /// Replace the queue declaration (TTL, max length, dead-letter key).
    #[must_use]
    pub fn with_queue_spec(mut self, spec: QueueSpec) -> Self {
        self.queue = spec;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("route", &self.route)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// All bindings a dispatcher serves. One handler per queue.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    bindings: Vec<Binding>,
    queues: HashSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: Binding) -> Result<(), DispatchError> {
        if !self.queues.insert(binding.queue_name().to_string()) {
            return Err(DispatchError::DuplicateQueue(binding.queue_name().to_string()));
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, binding: Binding) -> Result<Self, DispatchError> {
        self.register(binding)?;
        Ok(self)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) fn into_bindings(self) -> Vec<Binding> {
        self.bindings
    }
}
