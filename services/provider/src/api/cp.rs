//! Informational endpoints.

use std::collections::BTreeMap;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use cp_placement::{AcceleratorSlots, AcceleratorSummary, Architecture, Inventory, Resources};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::success;
use crate::error::ProviderError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cp", get(cluster_resources))
        .route("/cp/info", get(cp_info))
}

#[derive(Debug, Serialize)]
pub struct CpInfo {
    pub node_id: String,
    pub multi_address: String,
    /// 1 when proof tasks are accepted.
    pub ubi_task: u8,
}

#[derive(Debug, Serialize)]
pub struct NodeResources {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    pub capacity: Resources,
    pub remainder: Resources,
    pub accelerators: BTreeMap<String, AcceleratorSlots>,
}

/// GET /api/v1/computing/cp/info
async fn cp_info(State(state): State<AppState>) -> impl IntoResponse {
    let info = state.info();
    success(CpInfo {
        node_id: info.node_id.clone(),
        multi_address: info.multi_address.clone(),
        ubi_task: u8::from(info.ubi_task),
    })
}

/// GET /api/v1/computing/cp
///
/// Per-node capacity, remainder and accelerator slots, from a fresh listing.
async fn cluster_resources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let nodes = state.cluster().list_nodes().await.map_err(ProviderError::from)?;
    let workloads = state.cluster().list_workloads().await.map_err(ProviderError::from)?;
    let inventory = Inventory::snapshot(&nodes, &workloads);
    let accelerators = AcceleratorSummary::build(&nodes, &workloads);

    let report: Vec<NodeResources> = nodes
        .iter()
        .map(|node| {
            let remainder = inventory
                .remainder(&node.name)
                .map(|r| Resources::new(r.cpu, r.memory, r.storage))
                .unwrap_or(node.capacity);
            NodeResources {
                name: node.name.clone(),
                architecture: node.architecture(),
                capacity: node.capacity,
                remainder,
                accelerators: accelerators.node(&node.name).cloned().unwrap_or_default(),
            }
        })
        .collect();
    Ok(success(report))
}
