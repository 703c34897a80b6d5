//! Proof task endpoints.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::success;
use crate::dispatcher::UbiTaskRequest;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cp/ubi", post(submit_task))
        .route("/cp/ubi/tasks", get(list_tasks))
        .route("/cp/docker/receive/ubi", post(receive_proof))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub show_failed: bool,
}

/// POST /api/v1/computing/cp/ubi
///
/// Answers once the task is validated, authorized and recorded; placement and
/// job submission continue in the background.
async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<UbiTaskRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let record = state.dispatcher().submit(request).await?;
    Ok(success(record))
}

/// POST /api/v1/computing/cp/docker/receive/ubi
///
/// The body is taken raw so that a malformed callback still settles its task.
async fn receive_proof(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let tx = state.dispatcher().receive_proof(&body).await?;
    Ok(success(tx))
}

/// GET /api/v1/computing/cp/ubi/tasks
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.dispatcher().list_tasks(query.show_failed).await?;
    Ok(success(tasks))
}
