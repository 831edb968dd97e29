use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::WorkerId;

/// Raised while turning configuration into a task graph. Always fatal to the build.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task `{task}` node `{key}`: missing required field `{field}`")]
    MissingField {
        task: String,
        key: String,
        field: &'static str,
    },

    #[error("task `{task}` node `{key}`: unknown plugin type `{kind}`")]
    UnknownType {
        task: String,
        key: String,
        kind: String,
    },

    #[error("task `{task}` node `{key}`: unknown error handler `{name}`")]
    UnknownHandler {
        task: String,
        key: String,
        name: String,
    },

    #[error("task `{task}` node `{key}`: invalid `{field}`: {reason}")]
    Invalid {
        task: String,
        key: String,
        field: &'static str,
        reason: String,
    },

    #[error("task `{task}` node `{key}`: plugin rejected its config: {reason}")]
    Plugin {
        task: String,
        key: String,
        reason: String,
    },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A target could not be resolved or reached. Fatal to the current delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingError {
    #[error("unknown task `{0}`")]
    UnknownTask(String),

    #[error("task `{task}` has no node `{key}`")]
    UnknownNode { task: String, key: String },

    #[error("worker {0} is not part of the topology")]
    UnknownWorker(WorkerId),

    #[error("topology has no workers")]
    NoWorkers,
}

/// Failure delivering a message across a worker or host boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderError {
    #[error("no reply within {0} ms")]
    Timeout(u64),

    #[error("destination `{0}` is not reachable")]
    Disconnected(String),

    #[error("remote `{at}` failed: {message}")]
    Remote { at: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not marshal message: {0}")]
    Marshal(String),
}

/// Lock store failure. Contention is never reported through this type.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    #[error("no lock store registered under `{0}`")]
    UnknownStore(String),

    #[error("lock store `{store}` failed: {reason}")]
    Backend { store: String, reason: String },
}

/// The fault type of a node's `run`. Recoverable only through the node's handler chain.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("run failed: {0}")]
    Run(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Sender(#[from] SenderError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl NodeError {
    pub fn run(msg: impl Into<String>) -> Self {
        NodeError::Run(msg.into())
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        NodeError::Run(format!("{err:#}"))
    }
}
