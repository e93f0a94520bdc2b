//! Prometheus metrics for Courier components.
//!
//! All metrics follow the naming convention: `courier_<component>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RPC CLIENT
    // =========================================================================

    /// Calls by terminal outcome
    pub static ref RPC_CALLS: CounterVec = CounterVec::new(
        Opts::new("courier_rpc_calls_total", "RPC calls by terminal outcome"),
        &["outcome"]  // success/remote_error/timeout/transport_error/decode_error
    ).expect("metric creation failed");

    /// Call latency from publish to terminal outcome
    pub static ref RPC_CALL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "courier_rpc_call_duration_seconds",
            "Time from publish to terminal outcome"
        ).buckets(exponential_buckets(0.001, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Replies that matched no outstanding call
    pub static ref RPC_DISCARDED_REPLIES: Counter = Counter::new(
        "courier_rpc_discarded_replies_total",
        "Late or foreign replies discarded by the reply listener"
    ).expect("metric creation failed");

    // =========================================================================
    // DISPATCHER
    // =========================================================================

    /// Handled requests by response code
    pub static ref DISPATCH_RESULTS: CounterVec = CounterVec::new(
        Opts::new("courier_dispatch_total", "Dispatched requests by response code"),
        &["code"]
    ).expect("metric creation failed");

    /// Handler panics converted to error responses
    pub static ref HANDLER_PANICS: Counter = Counter::new(
        "courier_dispatch_handler_panics_total",
        "Handler panics caught by the dispatcher"
    ).expect("metric creation failed");

    // =========================================================================
    // IDEMPOTENCY
    // =========================================================================

    /// Claim attempts by result
    pub static ref IDEMPOTENCY_CLAIMS: CounterVec = CounterVec::new(
        Opts::new("courier_idempotency_claims_total", "Idempotency claims by result"),
        &["result"]  // won/lost
    ).expect("metric creation failed");

    /// Duplicate deliveries answered from a recorded result
    pub static ref IDEMPOTENT_REPLAYS: Counter = Counter::new(
        "courier_idempotent_replays_total",
        "Duplicate deliveries answered from a recorded terminal state"
    ).expect("metric creation failed");

    // =========================================================================
    // RELIABILITY
    // =========================================================================

    /// Dead-lettered messages seen by dead-letter consumers
    pub static ref DEAD_LETTERS: CounterVec = CounterVec::new(
        Opts::new("courier_dead_letters_total", "Dead-lettered messages by route"),
        &["route"]
    ).expect("metric creation failed");

    /// Messages republished for another attempt
    pub static ref RETRIES: CounterVec = CounterVec::new(
        Opts::new("courier_retries_total", "Retried messages by route"),
        &["route"]
    ).expect("metric creation failed");

    /// Messages moved to the poison holding area
    pub static ref POISONED: CounterVec = CounterVec::new(
        Opts::new("courier_poisoned_total", "Poisoned messages by route"),
        &["route"]
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Calling it again is harmless.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RPC_CALLS.clone()),
        Box::new(RPC_CALL_DURATION.clone()),
        Box::new(RPC_DISCARDED_REPLIES.clone()),
        Box::new(DISPATCH_RESULTS.clone()),
        Box::new(HANDLER_PANICS.clone()),
        Box::new(IDEMPOTENCY_CLAIMS.clone()),
        Box::new(IDEMPOTENT_REPLAYS.clone()),
        Box::new(DEAD_LETTERS.clone()),
        Box::new(RETRIES.clone()),
        Box::new(POISONED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
