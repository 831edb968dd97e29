//! Parsed graph configuration.
//!
//! A document maps task name -> node key -> node definition. Both levels keep the
//! order in which keys are declared; that order is the build order.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::logger::LogLevel;
use crate::topology::WorkerId;

pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// How an output edge delivers to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Same worker, awaited in place; a failure aborts only that branch.
    Local,
    /// A uniformly random worker among the known set.
    Distribute,
    /// Always this worker.
    Worker(WorkerId),
    /// Inline handoff by value; the caller observes the result or the error.
    Wait,
    /// Another host, addressed by base URL.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub target: String,
    pub mode: TransferMode,
}

/// A named handler plus its own config (`null` when given as a bare name).
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub name: String,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub key: String,
    pub kind: String,
    pub config: Value,
    pub outputs: Vec<OutputSpec>,
    pub start: bool,
    pub singleton: bool,
    pub lock_ttl: Duration,
    pub error_handlers: Vec<HandlerSpec>,
    pub log_level: LogLevel,
    pub wait_timeout: Option<Duration>,
}

impl NodeSpec {
    /// Bare node, mostly for building graphs in code.
    pub fn new(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            config: Value::Null,
            outputs: Vec::new(),
            start: false,
            singleton: true,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            error_handlers: Vec::new(),
            log_level: LogLevel::Info,
            wait_timeout: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn output(mut self, target: impl Into<String>, mode: TransferMode) -> Self {
        self.outputs.push(OutputSpec {
            target: target.into(),
            mode,
        });
        self
    }

    pub fn start(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn stateless(mut self) -> Self {
        self.singleton = false;
        self
    }

    pub fn handler(mut self, name: impl Into<String>, config: Value) -> Self {
        self.error_handlers.push(HandlerSpec {
            name: name.into(),
            config,
        });
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeSpec>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphConfig {
    pub tasks: Vec<TaskSpec>,
}

impl GraphConfig {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_yaml_bw::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(tasks) = value else {
            return Err(ConfigError::Parse(
                "top level must map task names to nodes".to_string(),
            ));
        };
        let mut out = Vec::with_capacity(tasks.len());
        for (task, nodes) in tasks {
            let Value::Object(nodes) = nodes else {
                return Err(ConfigError::Parse(format!(
                    "task `{task}` must map node keys to node specs"
                )));
            };
            let mut specs = Vec::with_capacity(nodes.len());
            for (key, raw) in nodes {
                specs.push(parse_node(&task, key, raw)?);
            }
            out.push(TaskSpec::new(task, specs));
        }
        Ok(Self { tasks: out })
    }
}

/// Document shape of one node, as written in a graph file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawNodeSpec {
    /// Plugin type selector, resolved through the plugin registry.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub output: Option<RawOutput>,
    #[serde(default)]
    pub start: bool,
    /// Shared across concurrent invocations (default) or serialized.
    #[serde(default = "default_true")]
    pub singleton: bool,
    /// Seconds.
    #[serde(default)]
    pub lock_ttl: Option<u64>,
    #[serde(default)]
    pub error_handlers: Vec<RawHandler>,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Milliseconds to wait for a cross-boundary reply; 0 is fire-and-forget.
    #[serde(default)]
    pub wait_timeout_ms: Option<i64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RawOutput {
    /// A single target delivered locally.
    Single(String),
    /// Target name -> transfer mode, in declaration order.
    Map(
        #[schemars(with = "BTreeMap<String, RawTransfer>")]
        Map<String, Value>,
    ),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RawTransfer {
    /// `false` local, `true` distribute.
    Flag(bool),
    Worker(WorkerId),
    /// Only `"wait"` is accepted.
    Named(String),
    Remote { remote: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RawHandler {
    Name(String),
    WithConfig(#[schemars(with = "BTreeMap<String, Value>")] Map<String, Value>),
}

/// Whole document: task name -> node key -> node definition.
pub type RawGraph = BTreeMap<String, BTreeMap<String, RawNodeSpec>>;

/// JSON schema of a graph document.
pub fn graph_schema() -> schemars::Schema {
    schemars::schema_for!(RawGraph)
}

fn parse_node(task: &str, key: String, raw: Value) -> Result<NodeSpec, ConfigError> {
    let invalid = |field: &'static str, reason: String| ConfigError::Invalid {
        task: task.to_string(),
        key: key.clone(),
        field,
        reason,
    };

    let raw: RawNodeSpec =
        serde_json::from_value(raw).map_err(|e| invalid("node", e.to_string()))?;

    let kind = raw.kind.ok_or_else(|| ConfigError::MissingField {
        task: task.to_string(),
        key: key.clone(),
        field: "type",
    })?;

    let outputs = match raw.output {
        None => Vec::new(),
        Some(RawOutput::Single(target)) => vec![OutputSpec {
            target,
            mode: TransferMode::Local,
        }],
        Some(RawOutput::Map(map)) => {
            let mut outputs = Vec::with_capacity(map.len());
            for (target, mode) in map {
                let mode: RawTransfer = serde_json::from_value(mode)
                    .map_err(|e| invalid("output", format!("`{target}`: {e}")))?;
                let mode = transfer_mode(mode).map_err(|reason| invalid("output", reason))?;
                outputs.push(OutputSpec { target, mode });
            }
            outputs
        }
    };

    let mut error_handlers = Vec::with_capacity(raw.error_handlers.len());
    for handler in raw.error_handlers {
        error_handlers.push(match handler {
            RawHandler::Name(name) => HandlerSpec {
                name,
                config: Value::Null,
            },
            RawHandler::WithConfig(map) => {
                let mut entries = map.into_iter();
                match (entries.next(), entries.next()) {
                    (Some((name, config)), None) => HandlerSpec { name, config },
                    _ => {
                        return Err(invalid(
                            "errorHandlers",
                            "an entry must be a name or a single-key mapping".to_string(),
                        ));
                    }
                }
            }
        });
    }

    let log_level = match raw.log_level {
        None => LogLevel::Info,
        Some(level) => level.parse().map_err(|e: String| invalid("logLevel", e))?,
    };

    let wait_timeout = match raw.wait_timeout_ms {
        Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
        _ => None,
    };

    Ok(NodeSpec {
        key,
        kind,
        config: raw.config,
        outputs,
        start: raw.start,
        singleton: raw.singleton,
        lock_ttl: Duration::from_secs(raw.lock_ttl.unwrap_or(DEFAULT_LOCK_TTL_SECS)),
        error_handlers,
        log_level,
        wait_timeout,
    })
}

fn transfer_mode(raw: RawTransfer) -> Result<TransferMode, String> {
    match raw {
        RawTransfer::Flag(false) => Ok(TransferMode::Local),
        RawTransfer::Flag(true) => Ok(TransferMode::Distribute),
        RawTransfer::Worker(id) => Ok(TransferMode::Worker(id)),
        RawTransfer::Named(name) if name == "wait" => Ok(TransferMode::Wait),
        RawTransfer::Named(name) => Err(format!("unknown transfer mode `{name}`")),
        RawTransfer::Remote { remote } => url::Url::parse(&remote)
            .map(|_| TransferMode::Remote(remote.clone()))
            .map_err(|e| format!("bad remote address `{remote}`: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_keep_declaration_order() {
        let cfg = GraphConfig::from_value(json!({
            "zeta": {"c": {"type": "log"}, "a": {"type": "log"}, "b": {"type": "log"}},
            "alpha": {"x": {"type": "log"}}
        }))
        .unwrap();
        let tasks: Vec<_> = cfg.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tasks, vec!["zeta", "alpha"]);
        let keys: Vec<_> = cfg.tasks[0].nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_output_forms() {
        let cfg = GraphConfig::from_value(json!({
            "t": {
                "A": {"type": "static", "output": "B", "start": true},
                "B": {"type": "passthrough", "output": {
                    "C": false, "D": true, "E": 2, "F": "wait",
                    "G": {"remote": "http://10.0.0.2:8080"}
                }}
            }
        }))
        .unwrap();
        let nodes = &cfg.tasks[0].nodes;
        assert!(nodes[0].start);
        assert_eq!(
            nodes[0].outputs,
            vec![OutputSpec { target: "B".into(), mode: TransferMode::Local }]
        );
        let modes: Vec<_> = nodes[1].outputs.iter().map(|o| (o.target.as_str(), o.mode.clone())).collect();
        assert_eq!(
            modes,
            vec![
                ("C", TransferMode::Local),
                ("D", TransferMode::Distribute),
                ("E", TransferMode::Worker(2)),
                ("F", TransferMode::Wait),
                ("G", TransferMode::Remote("http://10.0.0.2:8080".into())),
            ]
        );
    }

    #[test]
    fn test_missing_type_is_fatal() {
        let err = GraphConfig::from_value(json!({"t": {"A": {"output": "B"}}})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "type", .. }));
    }

    #[test]
    fn test_bad_transfer_mode_is_fatal() {
        let err = GraphConfig::from_value(json!({
            "t": {"A": {"type": "log", "output": {"B": "sometimes"}}}
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "output", .. }));
    }

    #[test]
    fn test_handlers_and_policies() {
        let cfg = GraphConfig::from_value(json!({
            "t": {"A": {
                "type": "log",
                "singleton": false,
                "lockTtl": 5,
                "logLevel": "debug",
                "waitTimeoutMs": 250,
                "errorHandlers": ["log", {"retry": {"attempts": 2}}]
            }}
        }))
        .unwrap();
        let node = &cfg.tasks[0].nodes[0];
        assert!(!node.singleton);
        assert_eq!(node.lock_ttl, Duration::from_secs(5));
        assert_eq!(node.log_level, LogLevel::Debug);
        assert_eq!(node.wait_timeout, Some(Duration::from_millis(250)));
        assert_eq!(node.error_handlers[0].name, "log");
        assert_eq!(node.error_handlers[1].config, json!({"attempts": 2}));
    }

    #[test]
    fn test_non_positive_wait_is_fire_and_forget() {
        let cfg = GraphConfig::from_value(json!({
            "t": {"A": {"type": "log", "waitTimeoutMs": -1}}
        }))
        .unwrap();
        assert_eq!(cfg.tasks[0].nodes[0].wait_timeout, None);
    }

    #[test]
    fn test_yaml_document() {
        let cfg = GraphConfig::from_yaml_str(
            "ingest:\n  A:\n    type: static\n    start: true\n    output: B\n  B:\n    type: log\n",
        )
        .unwrap();
        assert_eq!(cfg.tasks[0].name, "ingest");
        assert_eq!(cfg.tasks[0].nodes.len(), 2);
    }

    #[test]
    fn test_schema_mentions_fields() {
        let text = serde_json::to_string(&graph_schema()).unwrap();
        assert!(text.contains("RawNodeSpec"));
        assert!(text.contains("errorHandlers"));
        assert!(text.contains("waitTimeoutMs"));
    }
}
