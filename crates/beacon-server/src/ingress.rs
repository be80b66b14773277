//! Worker/host ingress: the durable task mutation happens first, then the
//! broadcaster is notified. These routes are internal glue, not a public
//! resource API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use beacon_core::ids::{TaskId, UserId};
use beacon_core::status::TaskStatus;
use beacon_store::StoreError;

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub owner_id: String,
    #[serde(default)]
    pub request: serde_json::Value,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Response {
    let owner = UserId::from_raw(req.owner_id);
    match state.tasks.create(&owner, req.request) {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TaskStatus,
    pub error: Option<String>,
}

pub async fn update_status(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<UpdateStatusRequest>,
) -> Response {
    let task_id = TaskId::from_raw(task_id);

    let task = match state
        .tasks
        .update_status(&task_id, req.status, req.error.as_deref())
    {
        Ok(task) => task,
        Err(e) => return store_error_response(e),
    };

    // The mutation is committed; a failed broadcast does not roll it back.
    match state.broadcaster.publish(&task) {
        Ok(body) => Json(json!({
            "task_id": task_id,
            "sequence": body.sequence,
            "terminal": body.terminal,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(task_id = %task_id, reason = e.kind(), error = %e, "broadcast failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "committed": true})),
            )
                .into_response()
        }
    }
}

pub async fn delete_task(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let task_id = TaskId::from_raw(task_id);

    if let Err(e) = state.tasks.delete(&task_id) {
        return store_error_response(e);
    }
    state.cache.invalidate(&task_id);
    let closed = state.registry.close_task(&task_id);

    Json(json!({"task_id": task_id, "closed_sessions": closed})).into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
