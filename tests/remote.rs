mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::Fixture;
use conduit::error::{NodeError, SenderError};
use conduit::handler::HandlerRegistry;
use conduit::message::Message;
use conduit::scheduler::{Outcome, Scheduler};
use conduit::sender::{Address, Envelope, RemoteSender, Sender};
use conduit::server;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn spawn_remote(scheduler: Arc<Scheduler>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move { server::serve_on(listener, scheduler, shutdown).await });
    (addr, token)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_round_trip_preserves_fields() {
    let far = Fixture::new();
    let remote = far.scheduler(
        json!({"t": {"B": {"type": "recorder"}}}),
        &HandlerRegistry::with_builtins(),
    );
    let (addr, token) = spawn_remote(remote).await;

    let mut msg = Message::with_id("t", "inv-7", json!({"user": "u1"})).with_data(json!([1, 2]));
    msg.opt_mut().set("table", json!("events"));

    let reply = RemoteSender::default()
        .send(
            Envelope::new("t", "B", msg),
            &Address::Remote(format!("http://{addr}")),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.task_id(), "inv-7");
    assert_eq!(reply.data(), &json!([1, 2]));
    assert_eq!(reply.request(), &json!({"user": "u1"}));
    assert_eq!(reply.opt().get("table"), Some(&json!("events")));

    let seen = far.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].task_id, "inv-7");
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_edge_from_graph() {
    let far = Fixture::new();
    let remote = far.scheduler(
        json!({"ingest": {"B": {"type": "recorder"}}}),
        &HandlerRegistry::with_builtins(),
    );
    let (addr, token) = spawn_remote(remote).await;

    let near = Fixture::new();
    let local = near.scheduler(
        json!({
            "ingest": {
                "A": {"type": "passthrough", "start": true,
                      "output": {"B": {"remote": format!("http://{addr}")}},
                      "waitTimeoutMs": 5000}
            }
        }),
        &HandlerRegistry::with_builtins(),
    );

    let runs = local.activate(Some("ingest"), json!({"order": 9})).await.unwrap();
    assert!(runs[0].is_ok());
    let seen = far.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].task_id, runs[0].task_id);
    assert_eq!(seen[0].data, json!({"order": 9}));
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_failure_is_typed() {
    let far = Fixture::new();
    let remote = far.scheduler(
        json!({"t": {"bad": {"type": "broken"}}}),
        &HandlerRegistry::with_builtins(),
    );
    let (addr, token) = spawn_remote(remote).await;
    let base = format!("http://{addr}");
    let sender = RemoteSender::default();

    let msg = Message::new("t", Value::Null).with_data(json!(1));
    let err = sender
        .send(Envelope::new("t", "bad", msg), &Address::Remote(base.clone()), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SenderError::Remote {
            at: base.clone(),
            message: "run failed: broken on purpose".into()
        }
    );

    let msg = Message::new("t", Value::Null).with_data(json!(1));
    let err = sender
        .send(Envelope::new("t", "nowhere", msg), &Address::Remote(base.clone()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::Remote { ref message, .. } if message.contains("has no node")));
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_remote_fails_the_node() {
    let near = Fixture::new();
    let local = near.scheduler(
        json!({
            "t": {
                "A": {"type": "passthrough", "start": true,
                      "output": {"B": {"remote": "http://127.0.0.1:9"}},
                      "waitTimeoutMs": 500}
            }
        }),
        &HandlerRegistry::with_builtins(),
    );

    let runs = local.activate(Some("t"), json!({"x": 1})).await.unwrap();
    assert!(matches!(
        &runs[0].outcome,
        Outcome::Failed { error: NodeError::Sender(SenderError::Transport(_) | SenderError::Timeout(_)) }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fire_and_forget_to_silent_host_is_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accepts connections and never answers
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let sender = RemoteSender::default().with_ack_timeout(Duration::from_millis(200));
    let msg = Message::new("t", Value::Null).with_data(json!(1));
    let sent = tokio::time::timeout(
        Duration::from_secs(3),
        sender.send(Envelope::new("t", "B", msg), &Address::Remote(format!("http://{addr}")), None),
    )
    .await
    .expect("fire-and-forget send must not hang");
    assert_eq!(sent.unwrap_err(), SenderError::Timeout(200));
    silent.abort();
}
