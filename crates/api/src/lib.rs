//! `api` crate: HTTP transport for the orchestration engine.
//!
//! Exposes:
//!   POST   /api/v1/metadata/workflow               register a definition
//!   GET    /api/v1/metadata/workflow/:name         fetch a definition (`?version=`)
//!   POST   /api/v1/workflow                        start an execution
//!   GET    /api/v1/workflow/:id                    read an execution
//!   POST   /api/v1/workflow/:id/pause
//!   POST   /api/v1/workflow/:id/resume
//!   POST   /api/v1/workflow/:id/terminate
//!   GET    /api/v1/tasks/poll/:task_type           lease a task (`?worker_id=&domain=`)
//!   POST   /api/v1/tasks                           report a task result
//!   POST   /api/v1/tasks/:task_id/ack              acknowledge a lease
//!   POST   /api/v1/tasks/:task_id/lease            extend a lease (heartbeat)
//!   GET    /health

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use engine::WorkflowExecutor;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<WorkflowExecutor>,
}

impl AppState {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/metadata/workflow", post(handlers::workflows::register))
        .route("/api/v1/metadata/workflow/:name", get(handlers::workflows::get))
        .route("/api/v1/workflow", post(handlers::executions::start))
        .route("/api/v1/workflow/:id", get(handlers::executions::get))
        .route("/api/v1/workflow/:id/pause", post(handlers::executions::pause))
        .route("/api/v1/workflow/:id/resume", post(handlers::executions::resume))
        .route("/api/v1/workflow/:id/terminate", post(handlers::executions::terminate))
        .route("/api/v1/tasks", post(handlers::tasks::update))
        .route("/api/v1/tasks/poll/:task_type", get(handlers::tasks::poll))
        .route("/api/v1/tasks/:task_id/ack", post(handlers::tasks::ack))
        .route("/api/v1/tasks/:task_id/lease", post(handlers::tasks::extend_lease))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
