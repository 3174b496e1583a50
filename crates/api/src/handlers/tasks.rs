use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::TaskResult;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub worker_id: Option<String>,
    pub domain: Option<String>,
}

/// 200 with the leased task, or 204 when nothing is pollable.
pub async fn poll(
    Path(task_type): Path<String>,
    Query(query): Query<PollQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let worker_id = query.worker_id.as_deref().unwrap_or("anonymous");
    let polled = state
        .executor
        .poll_task(&task_type, query.domain.as_deref(), worker_id)
        .await?;
    Ok(match polled {
        Some(polled) => Json(polled).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn update(
    State(state): State<AppState>,
    Json(result): Json<TaskResult>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.executor.update_task(result).await?;
    Ok(Json(json!({ "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct LeaseDto {
    pub lease_id: Uuid,
}

pub async fn ack(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(dto): Json<LeaseDto>,
) -> Result<StatusCode, ApiError> {
    state.executor.ack_task(task_id, dto.lease_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn extend_lease(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(dto): Json<LeaseDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let expires_at = state.executor.extend_lease(task_id, dto.lease_id).await?;
    Ok(Json(json!({ "expires_at": expires_at })))
}
