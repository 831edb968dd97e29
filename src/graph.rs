use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GraphConfig, TaskSpec};
use crate::error::{ConfigError, RoutingError};
use crate::handler::HandlerRegistry;
use crate::node::{PluginNode, PluginRegistry};

/// The nodes of one task, in declaration order.
#[derive(Debug, Default)]
pub struct Task {
    name: String,
    nodes: HashMap<String, Arc<PluginNode>>,
    order: Vec<String>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, key: &str) -> Option<&Arc<PluginNode>> {
        self.nodes.get(key)
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<PluginNode>> {
        self.order.iter().filter_map(|key| self.nodes.get(key))
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &Arc<PluginNode>> {
        self.nodes().filter(|node| node.is_start())
    }
}

/// Findings of [`TaskGraph::lint`]. None of them stops a graph from running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphWarning {
    #[error("task `{task}`: node `{from}` outputs to unknown node `{target}`")]
    UnresolvedOutput {
        task: String,
        from: String,
        target: String,
    },

    #[error("task `{task}`: cycle through {}", nodes.join(" -> "))]
    Cycle { task: String, nodes: Vec<String> },

    #[error("task `{task}`: node `{key}` is not reachable from any start node")]
    Unreachable { task: String, key: String },

    #[error("task `{task}` has no start node")]
    NoStartNode { task: String },
}

/// Task name -> node key -> node. Built once; wiring never changes afterwards.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every task in declaration order. Output targets are not
    /// resolved here; an unknown target fails when it is first routed to.
    pub fn build(
        config: &GraphConfig,
        plugins: &PluginRegistry,
        handlers: &HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        let mut graph = Self::new();
        for task in &config.tasks {
            graph.add_task(task, plugins, handlers)?;
        }
        info!(tasks = graph.tasks.len(), "task graph built");
        Ok(graph)
    }

    pub fn add_task(
        &mut self,
        spec: &TaskSpec,
        plugins: &PluginRegistry,
        handlers: &HandlerRegistry,
    ) -> Result<(), ConfigError> {
        if self.task(&spec.name).is_some() {
            return Err(ConfigError::Parse(format!("task `{}` declared twice", spec.name)));
        }
        let mut task = Task {
            name: spec.name.clone(),
            ..Task::default()
        };
        for node_spec in &spec.nodes {
            if task.nodes.contains_key(&node_spec.key) {
                return Err(ConfigError::Invalid {
                    task: spec.name.clone(),
                    key: node_spec.key.clone(),
                    field: "key",
                    reason: "declared twice".to_string(),
                });
            }
            let node = PluginNode::init(&spec.name, node_spec, plugins, handlers)?;
            debug!(task = %spec.name, node = %node_spec.key, kind = %node_spec.kind, "node initialized");
            task.order.push(node_spec.key.clone());
            task.nodes.insert(node_spec.key.clone(), Arc::new(node));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn node(&self, task: &str, key: &str) -> Result<&Arc<PluginNode>, RoutingError> {
        let found = self
            .task(task)
            .ok_or_else(|| RoutingError::UnknownTask(task.to_string()))?;
        found.node(key).ok_or_else(|| RoutingError::UnknownNode {
            task: task.to_string(),
            key: key.to_string(),
        })
    }

    /// Static checks over the wiring, in task declaration order.
    pub fn lint(&self) -> Vec<GraphWarning> {
        let mut warnings = Vec::new();
        for task in &self.tasks {
            lint_task(task, &mut warnings);
        }
        warnings
    }
}

fn lint_task(task: &Task, warnings: &mut Vec<GraphWarning>) {
    let mut graph: StableDiGraph<&str, ()> = StableDiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    for key in &task.order {
        index_of.insert(key.as_str(), graph.add_node(key.as_str()));
    }

    for node in task.nodes() {
        let from = index_of[node.key()];
        for output in node.outputs() {
            match index_of.get(output.target.as_str()) {
                Some(&to) => {
                    graph.add_edge(from, to, ());
                }
                None => warnings.push(GraphWarning::UnresolvedOutput {
                    task: task.name.clone(),
                    from: node.key().to_string(),
                    target: output.target.clone(),
                }),
            }
        }
    }

    for component in tarjan_scc(&graph) {
        let self_loop = component.len() == 1
            && graph.contains_edge(component[0], component[0]);
        if component.len() > 1 || self_loop {
            let mut nodes: Vec<String> = component.iter().map(|ix| graph[*ix].to_string()).collect();
            nodes.sort_by_key(|k| task.order.iter().position(|o| o == k));
            warnings.push(GraphWarning::Cycle {
                task: task.name.clone(),
                nodes,
            });
        }
    }

    let starts: Vec<NodeIndex> = task
        .start_nodes()
        .map(|node| index_of[node.key()])
        .collect();
    if starts.is_empty() {
        warnings.push(GraphWarning::NoStartNode {
            task: task.name.clone(),
        });
        return;
    }

    let mut reachable = HashSet::new();
    let mut stack = starts;
    while let Some(n) = stack.pop() {
        if reachable.insert(n) {
            stack.extend(graph.neighbors_directed(n, Direction::Outgoing));
        }
    }
    for key in &task.order {
        if !reachable.contains(&index_of[key.as_str()]) {
            warnings.push(GraphWarning::Unreachable {
                task: task.name.clone(),
                key: key.clone(),
            });
        }
    }
}
