//! # Runtime Configuration
//!
//! Typed settings for every component, overridable from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COURIER_SERVICE_NAME` | `user` |
//! | `COURIER_CALL_TIMEOUT_MS` | `10000` |
//! | `COURIER_PREFETCH` | `16` |
//! | `COURIER_MAX_RETRIES` | `3` |
//! | `COURIER_RETRY_BASE_MS` | `1000` |
//! | `COURIER_IDEMPOTENCY_SUCCESS_TTL_SECS` | `86400` |
//! | `COURIER_IDEMPOTENCY_FAILURE_TTL_SECS` | `300` |
//!
//! Unparseable values are logged and ignored.

use courier_telemetry::TelemetryConfig;
use cr_01_rpc_client::ClientConfig;
use cr_02_rpc_dispatcher::DispatcherConfig;
use cr_03_idempotency::IdempotencyConfig;
use cr_04_reliability::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of this service; also the consumer name in queue names.
    pub service_name: String,
    pub client: ClientConfig,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryPolicy,
    pub idempotency: IdempotencyConfig,
    pub telemetry: TelemetryConfig,
    /// How often expired idempotency entries are purged.
    pub purge_interval: Duration,
}

impl RuntimeConfig {
    pub fn for_service(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            client: ClientConfig::new(service_name),
            dispatcher: DispatcherConfig::new(service_name),
            retry: RetryPolicy::default(),
            idempotency: IdempotencyConfig::default(),
            telemetry: TelemetryConfig::for_service(service_name),
            purge_interval: Duration::from_secs(60),
        }
    }

    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let service_name = lookup("COURIER_SERVICE_NAME").unwrap_or_else(|| "user".to_string());
        let mut config = Self::for_service(&service_name);

        if let Some(ms) = parse::<u64>(&lookup, "COURIER_CALL_TIMEOUT_MS") {
            config.client.default_timeout = Duration::from_millis(ms);
        }
        if let Some(prefetch) = parse::<usize>(&lookup, "COURIER_PREFETCH") {
            config.dispatcher = config.dispatcher.with_prefetch(prefetch);
        }
        if let Some(retries) = parse::<u32>(&lookup, "COURIER_MAX_RETRIES") {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse::<u64>(&lookup, "COURIER_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_IDEMPOTENCY_SUCCESS_TTL_SECS") {
            config.idempotency.success_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_IDEMPOTENCY_FAILURE_TTL_SECS") {
            config.idempotency.failure_ttl = Duration::from_secs(secs);
        }
        if let Some(level) = lookup("COURIER_LOG_LEVEL") {
            config.telemetry.log_level = level;
        }
        if let Some(json) = lookup("COURIER_JSON_LOGS") {
            config.telemetry.json_logs = json.eq_ignore_ascii_case("true") || json == "1";
        }

        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}
