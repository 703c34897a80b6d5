//! HTTP API handlers and routing.

pub mod error;
mod cp;
mod health;
mod proof;
mod spaces;
mod ubi;

use axum::{
    http::{header, Method},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Prefix of every provider route.
pub const API_PREFIX: &str = "/api/v1/computing";

/// Success envelope: `{"status": "success", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Success<T> {
    pub status: String,
    pub data: T,
}

pub(crate) fn success<T: Serialize>(data: T) -> Json<Success<T>> {
    Json(Success {
        status: "success".to_string(),
        data,
    })
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let computing = Router::new()
        .merge(cp::routes())
        .merge(ubi::routes())
        .merge(spaces::routes())
        .merge(proof::routes());

    Router::new()
        .merge(health::routes())
        .nest(API_PREFIX, computing)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
