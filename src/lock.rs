use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use tracing::debug;

use crate::error::LockError;

pub const DEFAULT_LOCK_STORE: &str = "default";

// every this many acquisitions the in-memory store drops expired entries
const SWEEP_EVERY: u64 = 256;

/// External key/value service used for mutual exclusion across workers.
///
/// `set_if_absent` must be atomic: of two concurrent callers for the same key,
/// exactly one observes `true`.
#[async_trait]
pub trait LockStore: Send + Sync + Debug {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, LockError>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Process-local lock store. Shared by every worker of a `WorkerPool`.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: DashMap<String, LockEntry>,
    acquisitions: AtomicU64,
}

impl InMemoryLockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current owner of `key`, ignoring expired entries.
    pub fn owner(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.owner.clone())
    }

    /// Number of stored keys, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose TTL ran out. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "expired locks swept");
        }
        removed
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        if self.acquisitions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_expired();
        }
        let now = Instant::now();
        // the shard write lock held by `entry` makes check-and-set atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(false)
                } else {
                    occupied.insert(LockEntry {
                        owner: value.to_string(),
                        expires_at: now + ttl,
                    });
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    owner: value.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }
}

/// Named lock stores; a message picks one through its `lock_store_selector`.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    stores: HashMap<String, Arc<dyn LockStore>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose `default` selector points at a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new().with_store(DEFAULT_LOCK_STORE, InMemoryLockStore::new())
    }

    pub fn with_store(mut self, selector: impl Into<String>, store: Arc<dyn LockStore>) -> Self {
        self.stores.insert(selector.into(), store);
        self
    }

    pub fn get(&self, selector: &str) -> Result<Arc<dyn LockStore>, LockError> {
        self.stores
            .get(selector)
            .cloned()
            .ok_or_else(|| LockError::UnknownStore(selector.to_string()))
    }
}
