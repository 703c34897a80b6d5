//! Space deployment endpoints.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::success;
use crate::pipeline::{RenewOutcome, SpaceJob};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cp/spaces", post(receive_space).delete(cancel_space))
        .route("/cp/spaces/redeploy", post(redeploy_space))
        .route("/cp/spaces/renew", post(renew_space))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RenewRequest {
    pub task_uuid: String,
    pub duration: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub task_uuid: String,
}

/// Body of a renewal that arrived after the lease ran out.
#[derive(Debug, Serialize)]
pub struct RenewFailure {
    pub status: &'static str,
    pub message: &'static str,
}

/// POST /api/v1/computing/cp/spaces
///
/// Returns the job with its result URI and log URLs filled in.
async fn receive_space(
    State(state): State<AppState>,
    payload: Result<Json<SpaceJob>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(job) = payload?;
    let job = state.pipeline().receive(job).await?;
    Ok(Json(job))
}

/// POST /api/v1/computing/cp/spaces/redeploy
async fn redeploy_space(
    State(state): State<AppState>,
    payload: Result<Json<SpaceJob>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(job) = payload?;
    let job = state.pipeline().redeploy(job).await?;
    Ok(Json(job))
}

/// POST /api/v1/computing/cp/spaces/renew
async fn renew_space(
    State(state): State<AppState>,
    payload: Result<Json<RenewRequest>, JsonRejection>,
) -> Result<axum::response::Response, ApiError> {
    let Json(request) = payload?;
    let outcome = state
        .pipeline()
        .renew(&request.task_uuid, request.duration, Utc::now().timestamp())?;
    let response = match outcome {
        RenewOutcome::Extended { .. } => success("success").into_response(),
        RenewOutcome::Expired => Json(RenewFailure {
            status: "failed",
            message: "The job was terminated due to its expiration date",
        })
        .into_response(),
    };
    Ok(response)
}

/// DELETE /api/v1/computing/cp/spaces?task_uuid=
///
/// Unknown tasks are treated as already deleted.
async fn cancel_space(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.pipeline().cancel(&query.task_uuid)?;
    Ok(success("deleted success"))
}
