//! Probes for the provider process and its cluster connection.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// RFC 3339.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterProbe>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ClusterProbe {
    pub nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthResponse {
    fn new(status: &str, cluster: Option<ClusterProbe>) -> Self {
        Self {
            status: status.to_string(),
            service: "computing-provider".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            cluster,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::new("ok", None))
}

/// Ready once the cluster answers a node listing with at least one node.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let probe = match state.cluster().list_nodes().await {
        Ok(nodes) => ClusterProbe {
            nodes: nodes.len(),
            error: None,
        },
        Err(e) => ClusterProbe {
            nodes: 0,
            error: Some(e.to_string()),
        },
    };

    if probe.error.is_none() && probe.nodes > 0 {
        (StatusCode::OK, Json(HealthResponse::new("ok", Some(probe))))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::new("degraded", Some(probe))),
        )
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
