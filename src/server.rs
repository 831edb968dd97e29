use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::Scheduler;
use crate::sender::{REMOTE_ROUTE, RemoteRequest, RemoteResponse, RemoteStatus};

/// Serves remote dispatches into `scheduler`.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route(REMOTE_ROUTE, post(handle_dispatch))
        .with_state(scheduler)
}

async fn handle_dispatch(
    State(scheduler): State<Arc<Scheduler>>,
    Json(request): Json<RemoteRequest>,
) -> (StatusCode, Json<RemoteResponse>) {
    let response = scheduler.handle_remote(request).await;
    let status = match response.status {
        RemoteStatus::Ok => StatusCode::OK,
        RemoteStatus::Error => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(response))
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, scheduler, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, route = REMOTE_ROUTE, "dispatch endpoint listening");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
