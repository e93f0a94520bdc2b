//! # Courier Service Runtime
//!
//! Entry point: load configuration, start telemetry and the services on an
//! in-process broker, make one demo call, then serve until Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_telemetry::{encode_metrics, init_telemetry};
use service_runtime::handlers::{activate_route, ActivateUser, ActivatedUser};
use service_runtime::{RuntimeConfig, ServiceRuntime};
use shared_bus::InMemoryBroker;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env();
    init_telemetry(&config.telemetry).context("initializing telemetry")?;

    info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Courier starting"
    );

    let broker = InMemoryBroker::new();
    let runtime = ServiceRuntime::start(Arc::new(broker.clone()), config).await?;

    let request = ActivateUser {
        email: "demo@courier.dev".to_string(),
    };
    match runtime
        .client()
        .call::<_, ActivatedUser>(&activate_route()?, &request, None)
        .await
    {
        Ok(user) => info!(email = %user.email, status = ?user.status, "Demo activation succeeded"),
        Err(e) => error!(error = %e, "Demo activation failed"),
    }

    info!("Serving; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    runtime.shutdown().await;
    broker.close();

    info!(
        published = broker.messages_published(),
        dead_lettered = broker.messages_dead_lettered(),
        "Courier stopped"
    );
    if let Ok(metrics) = encode_metrics() {
        debug!(%metrics, "Final metrics");
    }
    Ok(())
}
