use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::LockError;
use crate::lock::{DEFAULT_LOCK_STORE, LockRegistry};

/// Side channel carried along an invocation.
///
/// `Locks` only grows until a cleanup drains it; every other key is free-form
/// (e.g. a destination table chosen at runtime).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Opt {
    #[serde(rename = "Locks", default)]
    locks: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Opt {
    pub fn locks(&self) -> &[String] {
        &self.locks
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.extra.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.extra.remove(name)
    }

    fn track_lock(&mut self, key: &str) {
        if !self.locks.iter().any(|k| k == key) {
            self.locks.push(key.to_string());
        }
    }
}

/// The invocation-scoped record that travels through a task graph.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "taskName")]
    task_name: String,
    #[serde(rename = "taskId")]
    task_id: String,
    data: Value,
    opt: Opt,
    request: Value,
    #[serde(rename = "lockStoreSelector", default = "default_selector")]
    lock_store_selector: String,
}

fn default_selector() -> String {
    DEFAULT_LOCK_STORE.to_string()
}

impl Message {
    /// A fresh invocation: new task id, empty payload, empty opt.
    pub fn new(task_name: impl Into<String>, request: Value) -> Self {
        Self::with_id(task_name, uuid::Uuid::new_v4().to_string(), request)
    }

    pub fn with_id(task_name: impl Into<String>, task_id: impl Into<String>, request: Value) -> Self {
        Self {
            task_name: task_name.into(),
            task_id: task_id.into(),
            data: Value::Null,
            opt: Opt::default(),
            request,
            lock_store_selector: default_selector(),
        }
    }

    pub(crate) fn from_parts(task_name: String, wire: WireMessage) -> Self {
        Self {
            task_name,
            task_id: wire.task_id,
            data: wire.data,
            opt: wire.opt,
            request: wire.request,
            lock_store_selector: wire.lock_store_selector.unwrap_or_else(default_selector),
        }
    }

    pub(crate) fn to_wire(&self) -> WireMessage {
        WireMessage {
            task_id: self.task_id.clone(),
            data: self.data.clone(),
            opt: self.opt.clone(),
            request: self.request.clone(),
            lock_store_selector: Some(self.lock_store_selector.clone())
                .filter(|s| s != DEFAULT_LOCK_STORE),
        }
    }

    /// Structural copy for fan-out: same invocation, opt and request, but an
    /// empty payload so branches never alias each other's data.
    pub fn fork(&self) -> Self {
        Self {
            task_name: self.task_name.clone(),
            task_id: self.task_id.clone(),
            data: Value::Null,
            opt: self.opt.clone(),
            request: self.request.clone(),
            lock_store_selector: self.lock_store_selector.clone(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_lock_store(mut self, selector: impl Into<String>) -> Self {
        self.lock_store_selector = selector.into();
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn set_data(&mut self, data: Value) {
        self.data = data;
    }

    pub fn take_data(&mut self) -> Value {
        self.data.take()
    }

    pub fn opt(&self) -> &Opt {
        &self.opt
    }

    pub fn opt_mut(&mut self) -> &mut Opt {
        &mut self.opt
    }

    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn lock_store_selector(&self) -> &str {
        &self.lock_store_selector
    }

    pub fn has_payload(&self) -> bool {
        !is_empty_payload(&self.data)
    }

    /// Try to take `key` (the task id when `None`) in the message's lock store.
    ///
    /// `Ok(false)` means another invocation holds it; that is contention, not a fault.
    pub async fn acquire_lock(
        &mut self,
        locks: &LockRegistry,
        key: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let key = key.unwrap_or(&self.task_id).to_string();
        let store = locks.get(&self.lock_store_selector)?;
        let acquired = store.set_if_absent(&key, &self.task_id, ttl).await?;
        if acquired {
            self.opt.track_lock(&key);
            debug!(task_id = %self.task_id, %key, "lock acquired");
        } else {
            debug!(task_id = %self.task_id, %key, "lock held elsewhere");
        }
        Ok(acquired)
    }

    /// Delete `key` unconditionally. An already expired or absent key is logged, not raised.
    pub async fn release_lock(&mut self, locks: &LockRegistry, key: &str) -> Result<bool, LockError> {
        let store = locks.get(&self.lock_store_selector)?;
        let removed = store.delete(key).await?;
        self.opt.locks.retain(|k| k != key);
        if !removed {
            warn!(task_id = %self.task_id, %key, "lock was already released or expired");
        }
        Ok(removed)
    }

    /// Drain `opt.Locks`, releasing each key independently. Returns how many
    /// keys were actually deleted; individual failures are logged and skipped.
    pub async fn release_all_locks(&mut self, locks: &LockRegistry) -> usize {
        self.release_locks_since(locks, 0).await
    }

    /// Release only the keys tracked after the first `mark` entries of `opt.Locks`.
    ///
    /// A branch forked from a lock holder starts with the holder's keys; those
    /// stay with the holder when the branch fails.
    pub async fn release_locks_since(&mut self, locks: &LockRegistry, mark: usize) -> usize {
        let mark = mark.min(self.opt.locks.len());
        let keys = self.opt.locks.split_off(mark);
        if keys.is_empty() {
            return 0;
        }
        let store = match locks.get(&self.lock_store_selector) {
            Ok(store) => store,
            Err(err) => {
                error!(task_id = %self.task_id, error = %err, "cannot release locks");
                return 0;
            }
        };
        let mut released = 0;
        for key in keys {
            match store.delete(&key).await {
                Ok(true) => released += 1,
                Ok(false) => warn!(task_id = %self.task_id, %key, "lock was already released or expired"),
                Err(err) => error!(task_id = %self.task_id, %key, error = %err, "lock release failed"),
            }
        }
        released
    }
}

/// `null`, `""`, `[]` and `{}` carry nothing worth forwarding.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Message body as it crosses a worker or host boundary. The task name travels
/// separately as the envelope key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub data: Value,
    #[serde(default)]
    pub opt: Opt,
    #[serde(default)]
    pub request: Value,
    #[serde(
        rename = "lockStoreSelector",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub lock_store_selector: Option<String>,
}
