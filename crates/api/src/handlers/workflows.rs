use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use engine::WorkflowDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<u32>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.executor.register_definition(&definition).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": definition.name, "version": definition.version })),
    ))
}

pub async fn get(
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let definition = state.executor.get_definition(&name, query.version).await?;
    Ok(Json(definition))
}
