//! # Service Runtime
//!
//! Starts every component against one transport, in dependency order:
//!
//! 1. Queue topologies and their dead-letter consumers
//! 2. Idempotency store and its purger
//! 3. RPC client (reply queue and listener)
//! 4. Dispatcher serving the handlers
//!
//! Shutdown runs in reverse: stop taking requests, fail pending calls, then
//! stop escalation and purging.

use crate::config::RuntimeConfig;
use crate::handlers::{
    activate_handler, activate_route, lookup_handler, lookup_route, send_email_handler,
    send_email_route, Outbox, UserDirectory,
};
use anyhow::{Context, Result};
use cr_01_rpc_client::RpcClient;
use cr_02_rpc_dispatcher::{Binding, BindingKind, Dispatcher, HandlerRegistry, RpcHandler};
use cr_03_idempotency::{IdempotencyService, InMemoryIdempotencyStore};
use cr_04_reliability::{DeadLetterConsumer, QueueTopology};
use parking_lot::Mutex;
use shared_bus::Transport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Service name the notification command consumer runs under.
pub const NOTIFICATION_SERVICE: &str = "notification";

/// A running set of services.
pub struct ServiceRuntime {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    client: Arc<RpcClient>,
    dispatcher: Dispatcher,
    dead_letters: Mutex<Vec<DeadLetterConsumer>>,
    topologies: Vec<QueueTopology>,
    idempotency: IdempotencyService,
    purge_shutdown: watch::Sender<bool>,
    purger: Mutex<Option<JoinHandle<()>>>,
    directory: Arc<UserDirectory>,
    outbox: Arc<Outbox>,
}

impl ServiceRuntime {
    pub async fn start(transport: Arc<dyn Transport>, config: RuntimeConfig) -> Result<Self> {
        info!(service = %config.service_name, "Starting service runtime");

        let services = [
            (activate_route()?, config.service_name.clone(), BindingKind::Rpc),
            (lookup_route()?, config.service_name.clone(), BindingKind::Rpc),
            (send_email_route()?, NOTIFICATION_SERVICE.to_string(), BindingKind::Command),
        ];

        // Step 1: topologies before the dispatcher declares the same queues
        let mut topologies = Vec::with_capacity(services.len());
        let mut dead_letters = Vec::with_capacity(services.len());
        for (route, consumer, _) in &services {
            let topology = QueueTopology::for_route(route, consumer);
            topology
                .declare(transport.as_ref())
                .await
                .with_context(|| format!("declaring topology for {route}"))?;
            let dead_letter =
                DeadLetterConsumer::spawn(Arc::clone(&transport), topology.clone(), config.retry.clone())
                    .await
                    .with_context(|| format!("starting dead-letter consumer for {route}"))?;
            topologies.push(topology);
            dead_letters.push(dead_letter);
        }

        // Step 2: idempotency
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let (purge_shutdown, purge_rx) = watch::channel(false);
        let purger = store.spawn_purger(config.purge_interval, purge_rx);
        let idempotency = IdempotencyService::new(store, config.idempotency.clone());

        // Step 3: client
        let client = Arc::new(
            RpcClient::start(Arc::clone(&transport), config.client.clone())
                .await
                .context("starting RPC client")?,
        );

        // Step 4: handlers
        let directory = Arc::new(UserDirectory::new());
        let outbox = Arc::new(Outbox::new());
        let mut registry = HandlerRegistry::new();
        for ((route, consumer, kind), topology) in services.iter().zip(&topologies) {
            let handler: Arc<dyn RpcHandler> = match route.action() {
                crate::handlers::user::ACTIVATE_ACTION => activate_handler(
                    Arc::clone(&directory),
                    idempotency.clone(),
                    Arc::clone(&client),
                    send_email_route()?,
                ),
                crate::handlers::user::LOOKUP_ACTION => lookup_handler(Arc::clone(&directory)),
                _ => send_email_handler(Arc::clone(&outbox), idempotency.clone()),
            };
            let binding = match kind {
                BindingKind::Rpc => Binding::rpc(route.clone(), consumer, handler),
                BindingKind::Command => Binding::command(route.clone(), consumer, handler),
            };
            registry.register(binding.with_queue_spec(topology.main.clone()))?;
        }

        let dispatcher = Dispatcher::start(Arc::clone(&transport), registry, config.dispatcher.clone())
            .await
            .context("starting dispatcher")?;

        info!(
            service = %config.service_name,
            bindings = topologies.len(),
            reply_queue = %client.reply_queue(),
            "Service runtime ready"
        );

        Ok(Self {
            config,
            transport,
            client,
            dispatcher,
            dead_letters: Mutex::new(dead_letters),
            topologies,
            idempotency,
            purge_shutdown,
            purger: Mutex::new(Some(purger)),
            directory,
            outbox,
        })
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!(service = %self.config.service_name, "Shutting down service runtime");

        self.dispatcher.shutdown().await;
        self.client.shutdown().await;

        let dead_letters: Vec<_> = std::mem::take(&mut *self.dead_letters.lock());
        for consumer in dead_letters {
            consumer.shutdown().await;
        }

        let _ = self.purge_shutdown.send(true);
        let purger = self.purger.lock().take();
        if let Some(handle) = purger {
            if let Err(e) = handle.await {
                error!(error = %e, "Idempotency purger ended abnormally");
            }
        }

        info!(service = %self.config.service_name, "Service runtime stopped");
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn idempotency(&self) -> &IdempotencyService {
        &self.idempotency
    }

    pub fn topologies(&self) -> &[QueueTopology] {
        &self.topologies
    }

    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.directory
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }
}
