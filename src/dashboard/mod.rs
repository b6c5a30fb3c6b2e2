use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::SharedDispatcher;
use crate::stats::StatCounter;
use crate::worker::WorkerSummary;

#[derive(Clone)]
pub struct DashboardState {
    pub dispatcher: SharedDispatcher,
    pub stats: Arc<StatCounter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkersResponse {
    pub pending_jobs: usize,
    pub idle_workers: usize,
    pub workers: Vec<WorkerSummary>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/workers", get(workers_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the stats API on `listener` until `shutdown` fires.
pub async fn run_dashboard(
    listener: TcpListener,
    state: DashboardState,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(addr = %addr, "Starting stats server"),
        Err(e) => tracing::warn!(error = %e, "Stats server address unknown"),
    }

    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Stats server failed");
    }
}

async fn stats_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher.lock().await;
    Json(WorkersResponse {
        pending_jobs: dispatcher.pending_len(),
        idle_workers: dispatcher.idle_worker_count(),
        workers: dispatcher.worker_summaries(Instant::now()),
    })
}
