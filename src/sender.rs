use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::SenderError;
use crate::message::{Message, WireMessage};
use crate::topology::WorkerId;

/// Fixed route a remote host serves dispatches on.
pub const REMOTE_ROUTE: &str = "/conduit/dispatch";

/// Where a message is headed once it leaves the current worker. Same-worker
/// delivery never goes through a [`Sender`]; the scheduler runs the target inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Worker(WorkerId),
    Remote(String),
}

/// A message addressed to `target` inside task `key`.
#[derive(Debug)]
pub struct Envelope {
    pub key: String,
    pub target: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(key: impl Into<String>, target: impl Into<String>, message: Message) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            message,
        }
    }
}

/// Delivery across a boundary.
///
/// `wait` of `None` is fire-and-forget and always yields `Ok(None)` once the
/// message is handed off. `Some(timeout)` blocks for the far side's final
/// message, and a failure over there comes back as [`SenderError::Remote`].
#[async_trait]
pub trait Sender: Send + Sync + Debug {
    async fn send(
        &self,
        envelope: Envelope,
        address: &Address,
        wait: Option<Duration>,
    ) -> Result<Option<Message>, SenderError>;
}

pub type WorkerReply = Result<String, String>;

/// What travels over a worker inbox: the message is already marshalled to JSON text.
#[derive(Debug)]
pub struct WorkerEnvelope {
    pub key: String,
    pub target: String,
    pub payload: String,
    pub reply: Option<oneshot::Sender<WorkerReply>>,
}

/// Inboxes of every worker in the pool.
#[derive(Debug, Default)]
pub struct WorkerHub {
    inboxes: DashMap<WorkerId, mpsc::Sender<WorkerEnvelope>>,
}

impl WorkerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: WorkerId, capacity: usize) -> mpsc::Receiver<WorkerEnvelope> {
        let (tx, rx) = mpsc::channel(capacity);
        if self.inboxes.insert(id, tx).is_some() {
            warn!(worker = id, "worker inbox replaced");
        }
        rx
    }

    pub fn deregister(&self, id: WorkerId) {
        self.inboxes.remove(&id);
    }

    pub fn inbox(&self, id: WorkerId) -> Option<mpsc::Sender<WorkerEnvelope>> {
        self.inboxes.get(&id).map(|tx| tx.clone())
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.inboxes.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

/// Cross-worker delivery inside one process group.
#[derive(Debug, Clone)]
pub struct WorkerSender {
    hub: Arc<WorkerHub>,
}

impl WorkerSender {
    pub fn new(hub: Arc<WorkerHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Sender for WorkerSender {
    async fn send(
        &self,
        envelope: Envelope,
        address: &Address,
        wait: Option<Duration>,
    ) -> Result<Option<Message>, SenderError> {
        let Address::Worker(id) = address else {
            return Err(SenderError::Transport(format!(
                "worker sender cannot reach {address:?}"
            )));
        };
        let inbox = self
            .hub
            .inbox(*id)
            .ok_or_else(|| SenderError::Disconnected(format!("worker {id}")))?;
        let payload = serde_json::to_string(&envelope.message.to_wire())
            .map_err(|e| SenderError::Marshal(e.to_string()))?;

        let (reply, rx) = match wait {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        debug!(worker = id, task = %envelope.key, target = %envelope.target, "dispatching to worker");
        inbox
            .send(WorkerEnvelope {
                key: envelope.key.clone(),
                target: envelope.target,
                payload,
                reply,
            })
            .await
            .map_err(|_| SenderError::Disconnected(format!("worker {id}")))?;

        let (Some(rx), Some(timeout)) = (rx, wait) else {
            return Ok(None);
        };
        let answer = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| SenderError::Timeout(timeout.as_millis() as u64))?
            .map_err(|_| SenderError::Disconnected(format!("worker {id} dropped the reply")))?;
        match answer {
            Ok(text) => {
                let wire: WireMessage =
                    serde_json::from_str(&text).map_err(|e| SenderError::Marshal(e.to_string()))?;
                Ok(Some(Message::from_parts(envelope.key, wire)))
            }
            Err(message) => Err(SenderError::Remote {
                at: format!("worker {id}"),
                message,
            }),
        }
    }
}

/// Body of a dispatch to a remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Task name.
    pub key: String,
    /// Node key inside that task.
    pub target: String,
    pub data: WireMessage,
    /// Whether the caller waits for the target's final message.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: RemoteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WireMessage>,
}

impl RemoteResponse {
    pub fn ok(data: Option<WireMessage>) -> Self {
        Self {
            status: RemoteStatus::Ok,
            error: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Error,
            error: Some(message.into()),
            data: None,
        }
    }
}

/// How long a fire-and-forget dispatch waits for the far side to acknowledge.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery to another host over HTTP.
///
/// Every request is bounded: by the caller's wait when it expects a reply,
/// by `ack_timeout` otherwise.
#[derive(Debug, Clone)]
pub struct RemoteSender {
    client: reqwest::Client,
    ack_timeout: Duration,
}

impl Default for RemoteSender {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl RemoteSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }
}

#[async_trait]
impl Sender for RemoteSender {
    async fn send(
        &self,
        envelope: Envelope,
        address: &Address,
        wait: Option<Duration>,
    ) -> Result<Option<Message>, SenderError> {
        let Address::Remote(base) = address else {
            return Err(SenderError::Transport(format!(
                "remote sender cannot reach {address:?}"
            )));
        };
        let url = url::Url::parse(base)
            .and_then(|u| u.join(REMOTE_ROUTE))
            .map_err(|e| SenderError::Transport(format!("bad remote address `{base}`: {e}")))?;

        let body = RemoteRequest {
            key: envelope.key.clone(),
            target: envelope.target,
            data: envelope.message.to_wire(),
            wait: wait.is_some(),
        };
        let timeout = wait.unwrap_or(self.ack_timeout);
        let request = self.client.post(url.clone()).json(&body).timeout(timeout);

        debug!(%url, task = %envelope.key, target = %body.target, "dispatching to remote host");
        let response = request.send().await.map_err(|e| transport_error(e, timeout))?;
        let http_status = response.status();
        let text = response.text().await.map_err(|e| transport_error(e, timeout))?;
        let answer: RemoteResponse = serde_json::from_str(&text).map_err(|_| {
            SenderError::Transport(format!("{url} answered {http_status}: {text}"))
        })?;

        match answer.status {
            RemoteStatus::Error => Err(SenderError::Remote {
                at: base.clone(),
                message: answer.error.unwrap_or_else(|| http_status.to_string()),
            }),
            RemoteStatus::Ok if wait.is_none() => Ok(None),
            RemoteStatus::Ok => Ok(answer
                .data
                .map(|wire| Message::from_parts(envelope.key, wire))),
        }
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> SenderError {
    if err.is_timeout() {
        SenderError::Timeout(timeout.as_millis() as u64)
    } else {
        SenderError::Transport(err.to_string())
    }
}
