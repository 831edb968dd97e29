use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{OutputSpec, TransferMode};
use crate::context::ContextStore;
use crate::error::{NodeError, RoutingError, SenderError};
use crate::graph::TaskGraph;
use crate::lock::LockRegistry;
use crate::message::Message;
use crate::node::PluginNode;
use crate::sender::{Address, Envelope, RemoteRequest, RemoteResponse, RemoteSender, Sender};
use crate::topology::{StaticTopology, Topology, WorkerId};

pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(600);

/// Outcome of one invocation started by [`Scheduler::activate`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Completed { data: Value },
    Failed { error: NodeError },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub task: String,
    pub task_id: String,
    pub start: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl Invocation {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Completed { .. })
    }
}

/// Drives one worker's copy of the task graph: activation and routing.
///
/// Everything a node needs at runtime (locks, topology, senders, invocation
/// state) is reached through here; nothing is looked up globally.
#[derive(Debug)]
pub struct Scheduler {
    graph: TaskGraph,
    locks: LockRegistry,
    topology: Arc<dyn Topology>,
    worker_sender: Option<Arc<dyn Sender>>,
    remote_sender: Option<Arc<dyn Sender>>,
    contexts: ContextStore,
    rng: Mutex<StdRng>,
}

pub struct SchedulerBuilder {
    graph: TaskGraph,
    locks: Option<LockRegistry>,
    topology: Option<Arc<dyn Topology>>,
    worker_sender: Option<Arc<dyn Sender>>,
    remote_sender: Option<Arc<dyn Sender>>,
    seed: Option<u64>,
    context_ttl: Duration,
}

impl SchedulerBuilder {
    pub fn locks(mut self, locks: LockRegistry) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn worker_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.worker_sender = Some(sender);
        self
    }

    pub fn remote_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.remote_sender = Some(sender);
        self
    }

    /// Fixes the placement of distributed outputs.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn context_ttl(mut self, ttl: Duration) -> Self {
        self.context_ttl = ttl;
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Arc::new(Scheduler {
            graph: self.graph,
            locks: self.locks.unwrap_or_else(LockRegistry::in_memory),
            topology: self
                .topology
                .unwrap_or_else(|| Arc::new(StaticTopology::single())),
            worker_sender: self.worker_sender,
            remote_sender: self
                .remote_sender
                .or_else(|| Some(Arc::new(RemoteSender::default()))),
            contexts: ContextStore::new(self.context_ttl),
            rng: Mutex::new(rng),
        })
    }
}

impl Scheduler {
    pub fn builder(graph: TaskGraph) -> SchedulerBuilder {
        SchedulerBuilder {
            graph,
            locks: None,
            topology: None,
            worker_sender: None,
            remote_sender: None,
            seed: None,
            context_ttl: DEFAULT_CONTEXT_TTL,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn node(&self, task: &str, key: &str) -> Result<&Arc<PluginNode>, RoutingError> {
        self.graph.node(task, key)
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn worker_id(&self) -> WorkerId {
        self.topology.current()
    }

    /// Start one invocation per start node, for `task` or for every task.
    ///
    /// Invocations run concurrently; their outcomes are reported, not raised.
    pub async fn activate(
        &self,
        task: Option<&str>,
        request: Value,
    ) -> Result<Vec<Invocation>, RoutingError> {
        let tasks: Vec<_> = match task {
            Some(name) => vec![
                self.graph
                    .task(name)
                    .ok_or_else(|| RoutingError::UnknownTask(name.to_string()))?,
            ],
            None => self.graph.tasks().iter().collect(),
        };

        let mut runs = Vec::new();
        for task in tasks {
            let starts: Vec<_> = task.start_nodes().collect();
            if starts.is_empty() {
                warn!(task = %task.name(), "task has no start node");
            }
            for node in starts {
                let msg = Message::new(task.name(), request.clone());
                runs.push(self.invoke(node, msg));
            }
        }
        Ok(join_all(runs).await)
    }

    async fn invoke(&self, node: &PluginNode, msg: Message) -> Invocation {
        let task_id = msg.task_id().to_string();
        let started_at = Utc::now();
        info!(task = %node.task_name(), start = %node.key(), %task_id, "invocation started");
        let outcome = match node.process(msg, self).await {
            Ok(mut done) => Outcome::Completed {
                data: done.take_data(),
            },
            Err(error) => {
                error!(task = %node.task_name(), start = %node.key(), %task_id, %error, "invocation failed");
                Outcome::Failed { error }
            }
        };
        Invocation {
            task: node.task_name().to_string(),
            task_id,
            start: node.key().to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
        }
    }

    /// Run `msg` through node `key` of `task` on this worker.
    pub async fn deliver_local(&self, task: &str, key: &str, msg: Message) -> Result<Message, NodeError> {
        let node = self.graph.node(task, key)?;
        node.process(msg, self).await
    }

    /// Send `msg` along one output edge of `from`.
    ///
    /// `target_worker` overrides local and distributed modes. Returns the
    /// target's final message when the edge waits for one.
    pub fn route<'a>(
        &'a self,
        from: &'a PluginNode,
        output: &'a OutputSpec,
        msg: Message,
        target_worker: Option<WorkerId>,
    ) -> BoxFuture<'a, Result<Option<Message>, NodeError>> {
        Box::pin(async move {
            if !msg.has_payload() {
                warn!(
                    task = %from.task_name(),
                    from = %from.key(),
                    to = %output.target,
                    "empty payload, not forwarded"
                );
                return Ok(None);
            }

            let task = from.task_name();
            let mode = match (&output.mode, target_worker) {
                (TransferMode::Local | TransferMode::Distribute, Some(worker)) => {
                    TransferMode::Worker(worker)
                }
                (mode, _) => mode.clone(),
            };
            debug!(task = %task, from = %from.key(), to = %output.target, ?mode, "routing");

            match mode {
                TransferMode::Local => {
                    self.deliver_inline(task, &output.target, msg, None).await
                }
                TransferMode::Wait => {
                    let node = self.graph.node(task, &output.target)?;
                    Ok(Some(node.process(msg, self).await?))
                }
                TransferMode::Distribute => {
                    let worker = self.pick_worker()?;
                    self.deliver_to_worker(task, &output.target, msg, worker, from.wait_timeout())
                        .await
                }
                TransferMode::Worker(worker) => {
                    if !self.topology.contains(worker) {
                        return Err(RoutingError::UnknownWorker(worker).into());
                    }
                    self.deliver_to_worker(task, &output.target, msg, worker, from.wait_timeout())
                        .await
                }
                TransferMode::Remote(address) => {
                    let sender = self
                        .remote_sender
                        .as_ref()
                        .ok_or_else(|| SenderError::Disconnected(address.clone()))?;
                    let envelope = Envelope::new(task, output.target.clone(), msg);
                    Ok(sender
                        .send(envelope, &Address::Remote(address), from.wait_timeout())
                        .await?)
                }
            }
        })
    }

    fn pick_worker(&self) -> Result<WorkerId, RoutingError> {
        let workers = self.topology.workers();
        if workers.is_empty() {
            return Err(RoutingError::NoWorkers);
        }
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.random_range(0..workers.len())
        };
        Ok(workers[index])
    }

    async fn deliver_to_worker(
        &self,
        task: &str,
        target: &str,
        msg: Message,
        worker: WorkerId,
        wait: Option<Duration>,
    ) -> Result<Option<Message>, NodeError> {
        if worker == self.topology.current() {
            return self.deliver_inline(task, target, msg, wait).await;
        }
        let sender = self
            .worker_sender
            .as_ref()
            .ok_or_else(|| SenderError::Disconnected(format!("worker {worker}")))?;
        let envelope = Envelope::new(task, target, msg);
        Ok(sender.send(envelope, &Address::Worker(worker), wait).await?)
    }

    /// Same-worker delivery. With a `wait` the caller sees the result or the
    /// failure; without one a failure aborts only the branch.
    async fn deliver_inline(
        &self,
        task: &str,
        target: &str,
        msg: Message,
        wait: Option<Duration>,
    ) -> Result<Option<Message>, NodeError> {
        let node = self.graph.node(task, target)?;
        let task_id = msg.task_id().to_string();
        match node.process(msg, self).await {
            Ok(done) => Ok(wait.map(|_| done)),
            Err(err) if wait.is_some() => Err(err),
            Err(err) => {
                error!(task = %task, node = %target, %task_id, error = %err, "branch aborted");
                Ok(None)
            }
        }
    }

    /// Serve a dispatch that arrived from another host.
    ///
    /// Without `wait` the message is processed in the background and the
    /// answer only acknowledges receipt.
    pub async fn handle_remote(self: &Arc<Self>, request: RemoteRequest) -> RemoteResponse {
        if let Err(err) = self.graph.node(&request.key, &request.target) {
            return RemoteResponse::error(err.to_string());
        }
        let msg = Message::from_parts(request.key.clone(), request.data);
        if request.wait {
            return match self.deliver_local(&request.key, &request.target, msg).await {
                Ok(done) => RemoteResponse::ok(Some(done.to_wire())),
                Err(err) => RemoteResponse::error(err.to_string()),
            };
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = scheduler
                .deliver_local(&request.key, &request.target, msg)
                .await
            {
                error!(task = %request.key, node = %request.target, error = %err, "remote dispatch failed");
            }
        });
        RemoteResponse::ok(None)
    }
}
