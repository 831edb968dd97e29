use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::GraphConfig;
use crate::error::{ConfigError, RoutingError};
use crate::graph::TaskGraph;
use crate::handler::HandlerRegistry;
use crate::lock::LockRegistry;
use crate::message::{Message, WireMessage};
use crate::node::PluginRegistry;
use crate::scheduler::{DEFAULT_CONTEXT_TTL, Invocation, Scheduler};
use crate::sender::{Sender, WorkerEnvelope, WorkerHub, WorkerSender};
use crate::topology::{StaticTopology, WorkerId};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: u32,
    /// Shared by every worker; ownership must be visible pool-wide.
    pub locks: LockRegistry,
    /// Worker `n` seeds its placement with `seed + n`.
    pub seed: Option<u64>,
    pub remote: Option<Arc<dyn Sender>>,
    pub context_ttl: Duration,
    pub inbox_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            locks: LockRegistry::in_memory(),
            seed: None,
            remote: None,
            context_ttl: DEFAULT_CONTEXT_TTL,
            inbox_capacity: 1024,
        }
    }
}

/// N workers in one process, each with its own copy of the task graph.
pub struct WorkerPool {
    hub: Arc<WorkerHub>,
    schedulers: Vec<Arc<Scheduler>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Build every worker's graph and start its inbox loop. Must be called
    /// from inside a tokio runtime.
    pub fn start(
        config: &GraphConfig,
        plugins: &PluginRegistry,
        handlers: &HandlerRegistry,
        options: PoolOptions,
    ) -> Result<Self, ConfigError> {
        let count = options.workers.max(1);
        let hub = Arc::new(WorkerHub::new());
        let worker_sender: Arc<dyn Sender> = Arc::new(WorkerSender::new(hub.clone()));
        let cancel = CancellationToken::new();

        let mut schedulers = Vec::with_capacity(count as usize);
        for id in 0..count {
            let graph = TaskGraph::build(config, plugins, handlers)?;
            let mut builder = Scheduler::builder(graph)
                .locks(options.locks.clone())
                .topology(Arc::new(StaticTopology::range(count, id)))
                .worker_sender(worker_sender.clone())
                .seed(options.seed.map(|seed| seed.wrapping_add(u64::from(id))))
                .context_ttl(options.context_ttl);
            if let Some(remote) = &options.remote {
                builder = builder.remote_sender(remote.clone());
            }
            schedulers.push(builder.build());
        }

        let mut handles = Vec::with_capacity(schedulers.len());
        for (id, scheduler) in (0..count).zip(&schedulers) {
            let inbox = hub.register(id, options.inbox_capacity);
            handles.push(tokio::spawn(run_worker(
                id,
                scheduler.clone(),
                inbox,
                cancel.child_token(),
            )));
        }
        info!(workers = count, "worker pool started");

        Ok(Self {
            hub,
            schedulers,
            cancel,
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn scheduler(&self, id: WorkerId) -> Option<&Arc<Scheduler>> {
        self.schedulers.get(id as usize)
    }

    pub fn schedulers(&self) -> &[Arc<Scheduler>] {
        &self.schedulers
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    /// Activate on worker `id`.
    pub async fn activate(
        &self,
        id: WorkerId,
        task: Option<&str>,
        request: Value,
    ) -> Result<Vec<Invocation>, RoutingError> {
        let scheduler = self
            .scheduler(id)
            .ok_or(RoutingError::UnknownWorker(id))?;
        scheduler.activate(task, request).await
    }

    /// Stop every inbox loop. Work already handed to a worker keeps running.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for id in self.hub.workers() {
            self.hub.deregister(id);
        }
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker loop ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    id: WorkerId,
    scheduler: Arc<Scheduler>,
    mut inbox: mpsc::Receiver<WorkerEnvelope>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "worker loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(envelope) => {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move { handle_envelope(&scheduler, envelope).await });
                }
                None => break,
            },
        }
    }
    debug!(worker = id, "worker loop stopped");
}

async fn handle_envelope(scheduler: &Scheduler, envelope: WorkerEnvelope) {
    let WorkerEnvelope {
        key,
        target,
        payload,
        reply,
    } = envelope;

    let result = match serde_json::from_str::<WireMessage>(&payload) {
        Ok(wire) => {
            let msg = Message::from_parts(key.clone(), wire);
            scheduler
                .deliver_local(&key, &target, msg)
                .await
                .map_err(|err| err.to_string())
        }
        Err(err) => Err(format!("could not unmarshal message: {err}")),
    };

    match reply {
        Some(reply) => {
            let answer = result.and_then(|done| {
                serde_json::to_string(&done.to_wire()).map_err(|e| e.to_string())
            });
            if reply.send(answer).is_err() {
                debug!(worker = scheduler.worker_id(), task = %key, node = %target, "caller stopped waiting");
            }
        }
        None => {
            if let Err(err) = result {
                error!(worker = scheduler.worker_id(), task = %key, node = %target, error = %err, "dispatch failed");
            }
        }
    }
}
