//! Axum handlers for the inbound task surface — spec.md §6.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::models::task::{Task, TaskId};
use crate::{OrchestratorError, PublicErrorCode};

use super::types::{ErrorDocument, StatusResponse, SubmitTaskResponse};
use super::ApiState;

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match self.public_code() {
            PublicErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            PublicErrorCode::NotFound => StatusCode::NOT_FOUND,
            PublicErrorCode::Cancelled => StatusCode::OK,
            PublicErrorCode::FailedInternal => StatusCode::INTERNAL_SERVER_ERROR,
            PublicErrorCode::FailedExternal => StatusCode::BAD_GATEWAY,
        };
        let document = ErrorDocument { code: self.public_code(), message: self.to_string(), field: None };
        (status, Json(document)).into_response()
    }
}

pub async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<super::types::SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, OrchestratorError> {
    let task = Task::new(
        request.title,
        request.description,
        request.task_type,
        request.priority,
        request.input,
        request.requester_id,
        request.metadata,
        request.deadline,
    )?;
    let task_id = task.id;
    state.engine.submit_task(task).await?;
    Ok(Json(SubmitTaskResponse { task_id, accepted_at: Utc::now() }))
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(task_id): Path<uuid::Uuid>,
) -> Result<Json<StatusResponse>, OrchestratorError> {
    let snapshot = state.engine.get_status_by_task(TaskId(task_id))?;
    Ok(Json(StatusResponse { snapshot }))
}

pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(task_id): Path<uuid::Uuid>,
) -> Result<Json<StatusResponse>, OrchestratorError> {
    let snapshot = state.engine.cancel_task_by_id(TaskId(task_id)).await?;
    Ok(Json(StatusResponse { snapshot }))
}
