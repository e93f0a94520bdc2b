//! # Idempotency Service
//!
//! Contract for side-effecting handlers:
//!
//! 1. `claim_first(key)` before doing anything
//! 2. Won: execute, then `record_result` or `record_failure`
//! 3. Lost: do not execute; replay the recorded terminal state, waiting while
//!    the winner is still processing
//!
//! Failures are kept for a shorter time than successes. A failure the caller
//! marks as transient is not recorded at all: the claim is released, so the
//! next delivery of the same key runs the operation again.

use crate::error::IdempotencyError;
use crate::store::{IdempotencyState, IdempotencyStore};
use courier_telemetry::{IDEMPOTENCY_CLAIMS, IDEMPOTENT_REPLAYS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Prefix applied to every key in the store.
pub const KEY_NAMESPACE: &str = "idem:";

/// TTLs and polling for the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a claim may stay `Processing` before another worker may take over.
    pub processing_ttl: Duration,
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    /// Pause between reads while waiting on another worker.
    pub poll_interval: Duration,
    /// Give up waiting on another worker after this long.
    pub wait_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            processing_ttl: Duration::from_secs(5 * 60),
            success_ttl: Duration::from_secs(24 * 60 * 60),
            failure_ttl: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`IdempotencyService::execute_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// This call won the claim and ran the operation.
    Executed(Result<T, String>),
    /// Another call already ran it; this is its recorded result.
    Duplicate(Result<T, String>),
    /// This call ran it and failed transiently. Nothing was recorded.
    Released(String),
}

impl<T> Outcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Executed(result) | Self::Duplicate(result) => result,
            Self::Released(message) => Err(message),
        }
    }
}

/// Duplicate suppression over an [`IdempotencyStore`].
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// True only for the first caller of `key` within the current TTL window.
    pub async fn claim_first(&self, key: &str) -> Result<bool, IdempotencyError> {
        let won = self
            .store
            .set_if_absent(&namespaced(key), IdempotencyState::Processing, self.config.processing_ttl)
            .await?;
        IDEMPOTENCY_CLAIMS
            .with_label_values(&[if won { "won" } else { "lost" }])
            .inc();
        debug!(key = %key, won, "Idempotency claim");
        Ok(won)
    }

    /// Recorded success JSON, if the key completed successfully.
    pub async fn get_cached_result(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        Ok(match self.state(key).await? {
            Some(IdempotencyState::Completed { result }) => Some(result),
            _ => None,
        })
    }

    /// Recorded failure message, if the key failed.
    pub async fn get_cached_failure(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        Ok(match self.state(key).await? {
            Some(IdempotencyState::Failed { message }) => Some(message),
            _ => None,
        })
    }

    pub async fn is_processing(&self, key: &str) -> Result<bool, IdempotencyError> {
        Ok(matches!(self.state(key).await?, Some(IdempotencyState::Processing)))
    }

    pub async fn state(&self, key: &str) -> Result<Option<IdempotencyState>, IdempotencyError> {
        self.store.get(&namespaced(key)).await
    }

    /// Record a successful result. `ttl` defaults to `success_ttl`.
    ///
    /// Returns false if the key already holds a terminal state, which is kept.
    pub async fn record_result(
        &self,
        key: &str,
        json: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<bool, IdempotencyError> {
        let state = IdempotencyState::Completed {
            result: json.into(),
        };
        self.record(key, state, ttl.unwrap_or(self.config.success_ttl))
            .await
    }

    /// Record a failure. `ttl` defaults to the shorter `failure_ttl`.
    pub async fn record_failure(
        &self,
        key: &str,
        message: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<bool, IdempotencyError> {
        let state = IdempotencyState::Failed {
            message: message.into(),
        };
        self.record(key, state, ttl.unwrap_or(self.config.failure_ttl))
            .await
    }

    /// Give up a `Processing` claim without recording an outcome.
    pub async fn release(&self, key: &str) -> Result<bool, IdempotencyError> {
        let released = self.store.release(&namespaced(key)).await?;
        debug!(key = %key, released, "Idempotency claim released");
        Ok(released)
    }

    async fn record(
        &self,
        key: &str,
        state: IdempotencyState,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let full_key = namespaced(key);
        if self.store.complete(&full_key, state.clone(), ttl).await? {
            return Ok(true);
        }
        // The claim expired while running: record anyway unless someone else
        // already holds the key
        let recorded = self.store.set_if_absent(&full_key, state, ttl).await?;
        if !recorded {
            warn!(key = %key, "Terminal state already recorded, keeping the first");
        }
        Ok(recorded)
    }

    /// Run `operation` at most once per key and TTL window.
    ///
    /// The winner runs it and records the outcome; every other caller gets the
    /// recorded outcome as [`Outcome::Duplicate`] without running anything.
    pub async fn execute_once<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<Outcome<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_once_or_release(key, operation, |_: &E| true)
            .await
    }

    /// [`execute_once`](Self::execute_once), recording only failures for
    /// which `permanent` holds.
    ///
    /// Any other failure releases the claim and comes back as
    /// [`Outcome::Released`], so a retry of the same key runs again.
    pub async fn execute_once_or_release<T, E, F, Fut, P>(
        &self,
        key: &str,
        operation: F,
        permanent: P,
    ) -> Result<Outcome<T>, IdempotencyError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        if self.claim_first(key).await? {
            return self.run_and_record(key, operation, permanent).await;
        }

        let started = Instant::now();
        loop {
            match self.state(key).await? {
                Some(IdempotencyState::Completed { result }) => {
                    IDEMPOTENT_REPLAYS.inc();
                    let value = serde_json::from_str(&result).map_err(|e| {
                        IdempotencyError::Decode {
                            key: key.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    return Ok(Outcome::Duplicate(Ok(value)));
                }
                Some(IdempotencyState::Failed { message }) => {
                    IDEMPOTENT_REPLAYS.inc();
                    return Ok(Outcome::Duplicate(Err(message)));
                }
                Some(IdempotencyState::Processing) => {
                    if started.elapsed() >= self.config.wait_timeout {
                        return Err(IdempotencyError::StillProcessing {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                // The winner's claim or failure expired: try to take over
                None => {
                    if self.claim_first(key).await? {
                        return self.run_and_record(key, operation, permanent).await;
                    }
                }
            }
        }
    }

    async fn run_and_record<T, E, F, Fut, P>(
        &self,
        key: &str,
        operation: F,
        permanent: P,
    ) -> Result<Outcome<T>, IdempotencyError>
    where
        T: Serialize,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let (is_permanent, message) = match operation().await {
            Ok(value) => {
                let json = serde_json::to_string(&value).map_err(|e| IdempotencyError::Encode {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                self.record_result(key, json, None).await?;
                return Ok(Outcome::Executed(Ok(value)));
            }
            Err(e) => (permanent(&e), e.to_string()),
        };

        if is_permanent {
            self.record_failure(key, message.as_str(), None).await?;
            Ok(Outcome::Executed(Err(message)))
        } else {
            self.release(key).await?;
            Ok(Outcome::Released(message))
        }
    }
}

fn namespaced(key: &str) -> String {
    format!("{KEY_NAMESPACE}{key}")
}
