use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::api::error::ApiError;
use crate::api::success;
use crate::proof::ProofRequest;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/cp/proof", post(run_proof))
}

/// POST /api/v1/computing/cp/proof
///
/// Runs a mining proof job to completion and returns its log.
async fn run_proof(
    State(state): State<AppState>,
    payload: Result<Json<ProofRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let logs = state.proofs().run(&request).await?;
    Ok(success(logs))
}
