use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

/// Key-value state private to one invocation.
#[derive(Debug, Default)]
pub struct InvocationState {
    store: DashMap<String, Value>,
}

impl InvocationState {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store.remove(key).map(|(_, v)| v)
    }
}

/// Invocation state for shared nodes, keyed by task id.
///
/// Nothing invocation-scoped is ever stored on a node instance; a plugin only
/// reaches state through the task id of the message it is running.
#[derive(Clone, Debug)]
pub struct ContextStore {
    cache: Cache<String, Arc<InvocationState>>,
}

impl ContextStore {
    /// Entries idle for longer than `ttl` are evicted.
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|key: Arc<String>, _value: Arc<InvocationState>, cause| {
                debug!("Invocation context evicted: task_id={}, cause={:?}", key, cause);
            })
            .build();
        Self { cache }
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<InvocationState>> {
        self.cache.get(task_id).await
    }

    pub async fn get_or_create(&self, task_id: &str) -> Arc<InvocationState> {
        self.cache
            .get_with(task_id.to_string(), async { Arc::new(InvocationState::default()) })
            .await
    }

    pub async fn remove(&self, task_id: &str) {
        self.cache.invalidate(task_id).await;
    }
}
