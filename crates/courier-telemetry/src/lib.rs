//! # Courier Telemetry
//!
//! Structured logging and Prometheus metrics shared by every Courier crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     init_telemetry(&TelemetryConfig::from_env()).expect("telemetry");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COURIER_SERVICE_NAME` | `courier` | Service name in logs |
//! | `COURIER_LOG_LEVEL` | `info` | Log level filter |
//! | `COURIER_JSON_LOGS` | `false` | JSON output |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, DEAD_LETTERS, DISPATCH_RESULTS, HANDLER_PANICS,
    IDEMPOTENCY_CLAIMS, IDEMPOTENT_REPLAYS, POISONED, RETRIES, RPC_CALLS, RPC_CALL_DURATION,
    RPC_DISCARDED_REPLIES,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logger: {0}")]
    LoggerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register metrics and install the log subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)
}
