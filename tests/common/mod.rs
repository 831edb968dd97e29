#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit::config::GraphConfig;
use conduit::error::NodeError;
use conduit::graph::TaskGraph;
use conduit::handler::HandlerRegistry;
use conduit::node::{Plugin, PluginRegistry, RunContext};
use conduit::scheduler::Scheduler;
use conduit::topology::WorkerId;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub node: String,
    pub worker: WorkerId,
    pub task_id: String,
    pub data: Value,
}

pub type Journal = Arc<Mutex<Vec<Seen>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records every message it receives, then forwards it.
#[derive(Debug)]
pub struct Recorder {
    journal: Journal,
}

#[async_trait]
impl Plugin for Recorder {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        self.journal.lock().unwrap().push(Seen {
            node: ctx.node().key().to_string(),
            worker: ctx.worker_id(),
            task_id: ctx.message().task_id().to_string(),
            data: ctx.data().clone(),
        });
        let data = ctx.data().clone();
        ctx.emit(data).await?;
        Ok(())
    }
}

/// Takes the invocation lock plus `job:1`, then fails.
#[derive(Debug)]
pub struct LockThenFail;

#[async_trait]
impl Plugin for LockThenFail {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        assert!(ctx.acquire_lock(None).await?);
        assert!(ctx.acquire_lock(Some("job:1")).await?);
        Err(NodeError::run("boom"))
    }
}

/// Fails its first `failures` runs, then emits the request.
#[derive(Debug)]
pub struct Flaky {
    failures: u32,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for Flaky {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        self.failures = config.get("failures").and_then(Value::as_u64).unwrap_or(1) as u32;
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            return Err(NodeError::run(format!("flaky run {run}")));
        }
        let data = ctx.request().clone();
        ctx.emit(data).await?;
        Ok(())
    }
}

/// Writes the request id into invocation state, yields, then emits what it reads back.
#[derive(Debug)]
pub struct StateEcho;

#[async_trait]
impl Plugin for StateEcho {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let id = ctx.request().get("id").cloned().unwrap_or(Value::Null);
        ctx.state().set("id", id);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let back = ctx.state().get("id").unwrap_or(Value::Null);
        ctx.emit(back).await?;
        Ok(())
    }
}

/// Tracks how many runs overlap.
#[derive(Debug)]
pub struct Overlap {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Overlap {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        let data = ctx.request().clone();
        ctx.emit(data).await?;
        Ok(())
    }
}

/// Sends its request to worker `worker` from config, overriding the edge mode.
#[derive(Debug, Default)]
pub struct EmitTo {
    worker: WorkerId,
}

#[async_trait]
impl Plugin for EmitTo {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        self.worker = config
            .get("worker")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("`worker` is required"))? as WorkerId;
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let data = ctx.request().clone();
        ctx.emit_to(data, self.worker).await?;
        Ok(())
    }
}

/// Always fails.
#[derive(Debug)]
pub struct Broken;

#[async_trait]
impl Plugin for Broken {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, _ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        Err(NodeError::run("broken on purpose"))
    }
}

pub struct Fixture {
    pub journal: Journal,
    pub flaky_runs: Arc<AtomicU32>,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            journal: journal(),
            flaky_runs: Arc::new(AtomicU32::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Built-ins plus the test plugins above, all sharing this fixture's journal and counters.
    pub fn plugins(&self) -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        let journal = self.journal.clone();
        registry.register("recorder", move || {
            Box::new(Recorder {
                journal: journal.clone(),
            })
        });
        registry.register("lock_then_fail", || Box::new(LockThenFail));
        let runs = self.flaky_runs.clone();
        registry.register("flaky", move || {
            Box::new(Flaky {
                failures: 1,
                runs: runs.clone(),
            })
        });
        registry.register("state_echo", || Box::new(StateEcho));
        let (active, peak) = (self.active.clone(), self.peak.clone());
        registry.register("overlap", move || {
            Box::new(Overlap {
                active: active.clone(),
                peak: peak.clone(),
            })
        });
        registry.register("emit_to", || Box::new(EmitTo::default()));
        registry.register("broken", || Box::new(Broken));
        registry
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.journal.lock().unwrap().clone()
    }

    pub fn scheduler(&self, config: Value, handlers: &HandlerRegistry) -> Arc<Scheduler> {
        let config = GraphConfig::from_value(config).unwrap();
        let graph = TaskGraph::build(&config, &self.plugins(), handlers).unwrap();
        Scheduler::builder(graph).seed(Some(1)).build()
    }
}
