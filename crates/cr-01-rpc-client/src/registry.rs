//! Correlation Registry - maps correlation IDs to callers awaiting a reply.
//!
//! Flow:
//! 1. Client generates a `CorrelationId`
//! 2. Client calls `register()` and gets a [`PendingHandle`] **before** publishing
//! 3. Client publishes the request
//! 4. The reply listener receives the reply and calls `complete()`
//! 5. The client awaits the handle, or times out and calls `abandon()`
//!
//! Both `complete()` and `abandon()` remove the entry through one atomic
//! `DashMap::remove`, so exactly one of them wins for a given ID and the
//! loser is a no-op.

use crate::error::RegistryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared_bus::RawEnvelope;
use shared_types::{CorrelationId, RouteKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reply delivered to a waiting caller: header plus undecoded payload.
pub type Reply = RawEnvelope;

/// One outstanding call.
struct PendingCall {
    sender: oneshot::Sender<Reply>,
    registered_at: Instant,
    route: String,
}

/// Counters for the registry.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Calls registered
    pub total_registered: AtomicU64,
    /// Calls completed by a reply
    pub total_completed: AtomicU64,
    /// Calls abandoned on timeout
    pub total_timeouts: AtomicU64,
    /// Replies matching no outstanding call
    pub total_discarded: AtomicU64,
    /// Calls dropped by their caller or failed on shutdown
    pub total_cancelled: AtomicU64,
}

/// Concurrent map from correlation ID to pending call.
///
/// Owned by one [`RpcClient`](crate::RpcClient); its lifetime is the client's.
pub struct CorrelationRegistry {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: RegistryStats,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    /// Register an outstanding call.
    ///
    /// # Errors
    ///
    /// `RegistryError::Duplicate` if the ID is already outstanding.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
        route: &RouteKey,
    ) -> Result<PendingHandle, RegistryError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(correlation_id) {
            Entry::Occupied(_) => return Err(RegistryError::Duplicate(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    sender: tx,
                    registered_at: Instant::now(),
                    route: route.to_string(),
                });
            }
        }
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(
            correlation_id = %correlation_id,
            route = %route,
            "Registered pending call"
        );

        Ok(PendingHandle {
            correlation_id,
            receiver: rx,
            registry: Arc::clone(self),
        })
    }

    /// Complete an outstanding call with its reply.
    ///
    /// Returns false if the ID is unknown (late or foreign reply) or the caller
    /// already went away. Never blocks.
    pub fn complete(&self, correlation_id: CorrelationId, reply: Reply) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            self.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                "Reply for unknown or expired correlation ID discarded"
            );
            return false;
        };

        let response_time = pending.registered_at.elapsed();
        match pending.sender.send(reply) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    route = %pending.route,
                    response_time_ms = response_time.as_millis() as u64,
                    "Completed pending call"
                );
                true
            }
            Err(_) => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    route = %pending.route,
                    "Pending call receiver dropped"
                );
                false
            }
        }
    }

    /// Remove a call whose deadline passed.
    ///
    /// Returns false if a reply already completed it.
    pub fn abandon(&self, correlation_id: &CorrelationId) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, pending)) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %correlation_id,
                    route = %pending.route,
                    elapsed_ms = pending.registered_at.elapsed().as_millis() as u64,
                    "Abandoned pending call after timeout"
                );
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call. Waiters observe a closed channel.
    ///
    /// Returns the number of calls failed.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.pending.remove(&id).is_some() {
                failed += 1;
            }
        }
        self.stats
            .total_cancelled
            .fetch_add(failed as u64, Ordering::Relaxed);
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn cancel(&self, correlation_id: &CorrelationId) {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "Pending call cancelled by caller");
        }
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller's side of a pending call.
///
/// Dropping the handle (e.g. the calling future was cancelled) removes the
/// registry entry, so nothing leaks while no one is waiting.
pub struct PendingHandle {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Reply>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the reply. Errors if the registry dropped the call.
    pub async fn wait(&mut self) -> Result<Reply, oneshot::error::RecvError> {
        (&mut self.receiver).await
    }

    /// Take a reply that already arrived.
    pub fn try_take(&mut self) -> Option<Reply> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.registry.cancel(&self.correlation_id);
    }
}
