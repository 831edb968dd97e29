use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::{NodeSpec, OutputSpec, TransferMode};
use crate::context::InvocationState;
use crate::error::{ConfigError, NodeError};
use crate::handler::{HandlerChain, HandlerRegistry};
use crate::logger::LogLevel;
use crate::message::{Message, is_empty_payload};
use crate::scheduler::Scheduler;
use crate::topology::WorkerId;

/// A concrete stage implementation (source, transform or sink).
///
/// `init` runs once at graph build; after that the plugin is shared by every
/// invocation that enters the node, so `run` only ever sees `&self`.
/// Anything invocation-scoped goes through the [`RunContext`].
#[async_trait]
pub trait Plugin: Send + Sync + Debug {
    fn init(&mut self, config: &Value) -> anyhow::Result<()>;

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError>;
}

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Plugin type name -> factory.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("PluginRegistry").field("types", &names).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Plugin>> {
        self.factories.get(kind).map(|factory| factory())
    }
}

/// An initialized graph vertex: the plugin plus its wiring and policies.
pub struct PluginNode {
    task_name: String,
    key: String,
    kind: String,
    config: Value,
    outputs: Vec<OutputSpec>,
    is_start: bool,
    lock_ttl: Duration,
    handlers: HandlerChain,
    log_level: LogLevel,
    wait_timeout: Option<Duration>,
    // present only for stateless nodes; serializes `process`
    gate: Option<Mutex<()>>,
    plugin: Box<dyn Plugin>,
}

impl Debug for PluginNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginNode")
            .field("task", &self.task_name)
            .field("key", &self.key)
            .field("type", &self.kind)
            .field("outputs", &self.outputs)
            .field("start", &self.is_start)
            .field("singleton", &self.gate.is_none())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl PluginNode {
    /// Resolve the plugin and handlers, and let the plugin validate its config.
    /// Any failure aborts the graph build.
    pub fn init(
        task_name: &str,
        spec: &NodeSpec,
        plugins: &PluginRegistry,
        handlers: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        let mut plugin = plugins
            .create(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownType {
                task: task_name.to_string(),
                key: spec.key.clone(),
                kind: spec.kind.clone(),
            })?;

        plugin
            .init(&spec.config)
            .map_err(|e| ConfigError::Plugin {
                task: task_name.to_string(),
                key: spec.key.clone(),
                reason: format!("{e:#}"),
            })?;

        let mut chain = Vec::with_capacity(spec.error_handlers.len());
        for handler in &spec.error_handlers {
            let created = handlers
                .create(handler)
                .ok_or_else(|| ConfigError::UnknownHandler {
                    task: task_name.to_string(),
                    key: spec.key.clone(),
                    name: handler.name.clone(),
                })?;
            chain.push(created.map_err(|e| ConfigError::Invalid {
                task: task_name.to_string(),
                key: spec.key.clone(),
                field: "errorHandlers",
                reason: format!("`{}`: {e:#}", handler.name),
            })?);
        }

        for output in &spec.outputs {
            if let TransferMode::Remote(address) = &output.mode {
                url::Url::parse(address).map_err(|e| ConfigError::Invalid {
                    task: task_name.to_string(),
                    key: spec.key.clone(),
                    field: "output",
                    reason: format!("bad remote address `{address}`: {e}"),
                })?;
            }
        }

        Ok(Self {
            task_name: task_name.to_string(),
            key: spec.key.clone(),
            kind: spec.kind.clone(),
            config: spec.config.clone(),
            outputs: spec.outputs.clone(),
            is_start: spec.start,
            lock_ttl: spec.lock_ttl,
            handlers: HandlerChain::new(chain),
            log_level: spec.log_level,
            wait_timeout: spec.wait_timeout,
            gate: (!spec.singleton).then(|| Mutex::new(())),
            plugin,
        })
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn is_start(&self) -> bool {
        self.is_start
    }

    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.gate.is_none()
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    /// The only entry point the scheduler uses.
    ///
    /// On a `run` failure the locks this node took are released first, then
    /// the handler chain decides; with no chain the error comes back unchanged.
    /// Keys inherited from upstream stay held.
    /// Returns the message as `run` left it (its `data` is the last emitted result).
    #[tracing::instrument(
        name = "node_process",
        skip(self, msg, scheduler),
        fields(task = %self.task_name, node = %self.key, task_id = %msg.task_id())
    )]
    pub async fn process(&self, mut msg: Message, scheduler: &Scheduler) -> Result<Message, NodeError> {
        let _serial = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        self.log_level.log(&self.key, "processing");
        let inherited = msg.opt().locks().len();
        match self.run(&mut msg, scheduler).await {
            Ok(()) => {
                self.log_level.log(&self.key, "processed");
                Ok(msg)
            }
            Err(err) => {
                error!(error = %err, "node run failed");
                let released = msg.release_locks_since(scheduler.locks(), inherited).await;
                if released > 0 {
                    debug!(released, "locks released after failure");
                }
                self.handlers.recover(self, &mut msg, scheduler, err).await?;
                Ok(msg)
            }
        }
    }

    /// One pass of the plugin over `msg`, with the invocation's state resolved by task id.
    pub async fn run(&self, msg: &mut Message, scheduler: &Scheduler) -> Result<(), NodeError> {
        let state = scheduler.contexts().get_or_create(msg.task_id()).await;
        let mut ctx = RunContext {
            node: self,
            msg,
            scheduler,
            state,
        };
        self.plugin.run(&mut ctx).await
    }
}

/// What a plugin sees while running one message.
pub struct RunContext<'a> {
    node: &'a PluginNode,
    msg: &'a mut Message,
    scheduler: &'a Scheduler,
    state: Arc<InvocationState>,
}

impl<'a> RunContext<'a> {
    pub fn node(&self) -> &PluginNode {
        self.node
    }

    pub fn config(&self) -> &Value {
        self.node.config()
    }

    pub fn message(&self) -> &Message {
        self.msg
    }

    pub fn message_mut(&mut self) -> &mut Message {
        self.msg
    }

    pub fn data(&self) -> &Value {
        self.msg.data()
    }

    pub fn request(&self) -> &Value {
        self.msg.request()
    }

    /// State private to this invocation, shared by every node it visits on this worker.
    pub fn state(&self) -> &InvocationState {
        &self.state
    }

    pub fn worker_id(&self) -> WorkerId {
        self.scheduler.worker_id()
    }

    /// Hand `result` to every declared output, in declaration order.
    ///
    /// An empty result is skipped with a warning. Replies are collected from
    /// outputs that wait for one.
    pub async fn emit(&mut self, result: Value) -> Result<Vec<Message>, NodeError> {
        self.emit_inner(result, None).await
    }

    /// Like [`emit`](Self::emit) but local and distributed outputs go to `worker`.
    pub async fn emit_to(&mut self, result: Value, worker: WorkerId) -> Result<Vec<Message>, NodeError> {
        self.emit_inner(result, Some(worker)).await
    }

    /// Row-by-row fan-out: every row travels in its own forked message.
    pub async fn emit_each(&mut self, rows: Vec<Value>) -> Result<Vec<Message>, NodeError> {
        let node = self.node;
        let mut replies = Vec::new();
        for row in rows {
            if is_empty_payload(&row) {
                warn!(node = %node.key(), "skipping empty row");
                continue;
            }
            for output in node.outputs() {
                let branch = self.msg.fork().with_data(row.clone());
                if let Some(reply) = self.scheduler.route(node, output, branch, None).await? {
                    replies.push(reply);
                }
            }
        }
        Ok(replies)
    }

    /// Keep `result` as the final payload; nothing is forwarded.
    pub fn sink(&mut self, result: Value) {
        self.msg.set_data(result);
    }

    pub async fn acquire_lock(&mut self, key: Option<&str>) -> Result<bool, NodeError> {
        let ttl = self.node.lock_ttl();
        Ok(self.msg.acquire_lock(self.scheduler.locks(), key, ttl).await?)
    }

    pub async fn release_lock(&mut self, key: &str) -> Result<bool, NodeError> {
        Ok(self.msg.release_lock(self.scheduler.locks(), key).await?)
    }

    pub async fn release_all_locks(&mut self) -> usize {
        self.msg.release_all_locks(self.scheduler.locks()).await
    }

    async fn emit_inner(
        &mut self,
        result: Value,
        target_worker: Option<WorkerId>,
    ) -> Result<Vec<Message>, NodeError> {
        if is_empty_payload(&result) {
            warn!(node = %self.node.key(), task_id = %self.msg.task_id(), "empty result, nothing emitted");
            return Ok(Vec::new());
        }
        self.msg.set_data(result);
        if self.node.is_sink() {
            debug!(node = %self.node.key(), "sink reached");
            return Ok(Vec::new());
        }

        let node = self.node;
        let mut replies = Vec::new();
        for output in node.outputs() {
            let branch = self.msg.fork().with_data(self.msg.data().clone());
            if let Some(reply) = self
                .scheduler
                .route(node, output, branch, target_worker)
                .await?
            {
                replies.push(reply);
            }
        }
        Ok(replies)
    }
}
