//! # Idempotency Store
//!
//! Key/value store with per-entry TTL and an atomic set-if-absent.
//!
//! The store must be shared by every instance of a service: duplicate
//! deliveries can land on different processes. [`InMemoryIdempotencyStore`]
//! covers a single process; a networked store (e.g. Redis `SET NX PX`) plugs in
//! behind the same trait.

use crate::error::IdempotencyError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of one idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyState {
    /// Claimed; the side effect is running.
    Processing,
    /// Finished; `result` is the JSON the first execution produced.
    Completed { result: String },
    /// Finished with an error.
    Failed { message: String },
}

impl IdempotencyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Store `state` under `key` only if no live entry exists.
    ///
    /// Returns true for exactly one caller per key per TTL window.
    async fn set_if_absent(
        &self,
        key: &str,
        state: IdempotencyState,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError>;

    /// Live entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyState>, IdempotencyError>;

    /// Move a `Processing` entry to a terminal state with a new TTL.
    ///
    /// Returns false, changing nothing, if the entry is missing, expired or
    /// already terminal.
    async fn complete(
        &self,
        key: &str,
        state: IdempotencyState,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError>;

    /// Drop a live `Processing` claim so the next `set_if_absent` wins.
    ///
    /// Returns false, changing nothing, if the entry is missing or terminal.
    async fn release(&self, key: &str) -> Result<bool, IdempotencyError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, IdempotencyError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    state: IdempotencyState,
    expires_at: Instant,
}

impl StoredEntry {
    fn new(state: IdempotencyState, ttl: Duration) -> Self {
        Self {
            state,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local store on a `DashMap`.
///
/// Expiry is lazy on access plus periodic via [`purge_expired`](IdempotencyStore::purge_expired).
/// Uses tokio's clock, so paused-time tests can advance past TTLs.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, StoredEntry>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge on a fixed interval until `shutdown` flips to true.
    pub fn spawn_purger(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(removed) = store.purge_expired().await {
                            if removed > 0 {
                                debug!(removed, "Purged expired idempotency entries");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        state: IdempotencyState,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let now = Instant::now();
        // The entry API holds the shard lock across check and insert
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(StoredEntry::new(state, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(state, ttl));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyState>, IdempotencyError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.state.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn complete(
        &self,
        key: &str,
        state: IdempotencyState,
        ttl: Duration,
    ) -> Result<bool, IdempotencyError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && !entry.state.is_terminal() => {
                *entry = StoredEntry::new(state, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<bool, IdempotencyError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && !entry.state.is_terminal())
            .is_some())
    }

    async fn purge_expired(&self) -> Result<usize, IdempotencyError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
