use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::HandlerSpec;
use crate::error::NodeError;
use crate::message::Message;
use crate::node::PluginNode;
use crate::scheduler::Scheduler;

/// One recovery step run after a node's `run` failed and its locks were released.
///
/// `Ok(())` means this step is satisfied and the chain moves on; an `Err`
/// replaces the original error and stops the chain.
#[async_trait]
pub trait ErrorHandler: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        node: &PluginNode,
        msg: &mut Message,
        scheduler: &Scheduler,
        error: &NodeError,
    ) -> Result<(), NodeError>;
}

#[derive(Debug, Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn ErrorHandler>>) -> Self {
        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Run handlers in order. The first handler failure is returned as-is and
    /// later handlers never run. An empty chain hands `error` back unchanged.
    pub async fn recover(
        &self,
        node: &PluginNode,
        msg: &mut Message,
        scheduler: &Scheduler,
        error: NodeError,
    ) -> Result<(), NodeError> {
        if self.handlers.is_empty() {
            return Err(error);
        }
        for handler in &self.handlers {
            if let Err(secondary) = handler.handle(node, msg, scheduler, &error).await {
                error!(
                    task = %node.task_name(),
                    node = %node.key(),
                    handler = handler.name(),
                    original = %error,
                    error = %secondary,
                    "error handler failed"
                );
                return Err(secondary);
            }
        }
        Ok(())
    }
}

/// Records the failure and absorbs it.
#[derive(Debug)]
pub struct LogHandler;

#[async_trait]
impl ErrorHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(
        &self,
        node: &PluginNode,
        msg: &mut Message,
        _scheduler: &Scheduler,
        error: &NodeError,
    ) -> Result<(), NodeError> {
        warn!(
            task = %node.task_name(),
            node = %node.key(),
            task_id = %msg.task_id(),
            %error,
            "node failure absorbed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 0,
        }
    }
}

/// Re-runs the node with the same message; the last failure replaces the original.
#[derive(Debug)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ErrorHandler for RetryHandler {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(
        &self,
        node: &PluginNode,
        msg: &mut Message,
        scheduler: &Scheduler,
        error: &NodeError,
    ) -> Result<(), NodeError> {
        let mut last = error.clone();
        for attempt in 1..=self.config.attempts {
            if self.config.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
            }
            info!(node = %node.key(), attempt, "retrying node");
            let inherited = msg.opt().locks().len();
            match node.run(msg, scheduler).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    msg.release_locks_since(scheduler.locks(), inherited).await;
                    last = err;
                }
            }
        }
        Err(last)
    }
}

/// Re-raises the error, ending the chain.
#[derive(Debug)]
pub struct FailHandler;

#[async_trait]
impl ErrorHandler for FailHandler {
    fn name(&self) -> &str {
        "fail"
    }

    async fn handle(
        &self,
        _node: &PluginNode,
        _msg: &mut Message,
        _scheduler: &Scheduler,
        error: &NodeError,
    ) -> Result<(), NodeError> {
        Err(error.clone())
    }
}

pub type HandlerFactory =
    Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn ErrorHandler>> + Send + Sync>;

/// Handler name -> factory, resolved once per node at build time.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", |_| Ok(Arc::new(LogHandler) as Arc<dyn ErrorHandler>));
        registry.register("fail", |_| Ok(Arc::new(FailHandler) as Arc<dyn ErrorHandler>));
        registry.register("retry", |cfg| {
            let config = if cfg.is_null() {
                RetryConfig::default()
            } else {
                serde_json::from_value(cfg.clone())?
            };
            Ok(Arc::new(RetryHandler::new(config)) as Arc<dyn ErrorHandler>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn ErrorHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// `None` when no factory is registered under `spec.name`.
    pub fn create(&self, spec: &HandlerSpec) -> Option<anyhow::Result<Arc<dyn ErrorHandler>>> {
        self.factories.get(&spec.name).map(|factory| factory(&spec.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("log"));
        assert!(registry.contains("retry"));
        assert!(registry.contains("fail"));
        assert!(!registry.contains("page-oncall"));
    }

    #[test]
    fn test_retry_config_parsing() {
        let registry = HandlerRegistry::with_builtins();
        let spec = HandlerSpec {
            name: "retry".into(),
            config: json!({"attempts": 5, "delayMs": 10}),
        };
        let handler = registry.create(&spec).unwrap().unwrap();
        assert_eq!(handler.name(), "retry");

        let bad = HandlerSpec {
            name: "retry".into(),
            config: json!({"attempts": "many"}),
        };
        assert!(registry.create(&bad).unwrap().is_err());
    }
}
