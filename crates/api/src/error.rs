//! Mapping engine errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::store::StoreError;
use engine::EngineError;
use queue::QueueError;
use serde_json::json;
use tracing::error;

/// Error returned by every handler. Renders as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InvalidDefinition(_) | EngineError::MissingInput(_) => StatusCode::BAD_REQUEST,
            EngineError::DefinitionNotFound { .. }
            | EngineError::ExecutionNotFound(_)
            | EngineError::TaskNotFound(_)
            | EngineError::Store(StoreError::ExecutionNotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::TaskNotPollable { .. }
            | EngineError::TaskAlreadyTerminal(_)
            | EngineError::StaleLease(_)
            | EngineError::InvalidState { .. }
            | EngineError::Store(StoreError::DefinitionExists { .. })
            | EngineError::Queue(
                QueueError::NotQueued(_) | QueueError::LeaseMismatch { .. } | QueueError::LeaseExpired { .. },
            ) => StatusCode::CONFLICT,
            EngineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
