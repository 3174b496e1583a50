use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{Execution, StartRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{ApiError, AppState};

pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = state.executor.start_workflow(request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "execution_id": id }))))
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.executor.get_execution(id).await?))
}

pub async fn pause(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.executor.pause(id).await?))
}

pub async fn resume(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.executor.resume(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateDto {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn terminate(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    body: Option<Json<TerminateDto>>,
) -> Result<Json<Execution>, ApiError> {
    let reason = body
        .and_then(|Json(dto)| dto.reason)
        .unwrap_or_else(|| "terminated by request".to_owned());
    Ok(Json(state.executor.terminate(id, &reason).await?))
}
