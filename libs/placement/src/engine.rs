//! Node selection.

use serde::Serialize;

use crate::accelerator::AcceleratorSummary;
use crate::error::{NotFoundReason, PlacementError};
use crate::inventory::Inventory;
use crate::types::{Architecture, Node, ResourceRequest, Workload};

/// Outcome of a successful placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub node: String,
    /// From the node's `INTEL`/`AMD` label. Picks the image variant.
    pub architecture: Option<Architecture>,
    /// Normalized product that satisfied the accelerator requirement, if any.
    pub accelerator_product: Option<String>,
}

/// Pluggable placement strategy.
pub trait PlacementStrategy: Send + Sync {
    fn place(
        &self,
        request: &ResourceRequest,
        nodes: &[Node],
        inventory: &Inventory,
        accelerators: &AcceleratorSummary,
    ) -> Result<Placement, PlacementError>;
}

/// First fit in listing order. No sorting, no load balancing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn place(
        &self,
        request: &ResourceRequest,
        nodes: &[Node],
        inventory: &Inventory,
        accelerators: &AcceleratorSummary,
    ) -> Result<Placement, PlacementError> {
        if nodes.is_empty() {
            return Err(PlacementError::NotFound {
                reason: NotFoundReason::NoNodes,
            });
        }

        let mut saw_capacity = false;
        for node in nodes {
            let Some(remainder) = inventory.remainder(&node.name) else {
                continue;
            };
            if !remainder.fits(request) {
                continue;
            }
            saw_capacity = true;

            let accelerator_product = match &request.accelerator {
                None => None,
                Some(wanted) => {
                    match accelerators.find_fit(&node.name, &wanted.name, wanted.count) {
                        Some(product) => Some(product.to_string()),
                        None => continue,
                    }
                }
            };

            return Ok(Placement {
                node: node.name.clone(),
                architecture: node.architecture(),
                accelerator_product,
            });
        }

        let reason = if saw_capacity {
            NotFoundReason::AcceleratorStarved
        } else {
            NotFoundReason::NoCapacity
        };
        Err(PlacementError::NotFound { reason })
    }
}

/// Build a fresh inventory and accelerator summary, then run `strategy`.
pub fn place(
    strategy: &dyn PlacementStrategy,
    request: &ResourceRequest,
    nodes: &[Node],
    workloads: &[Workload],
) -> Result<Placement, PlacementError> {
    let inventory = Inventory::snapshot(nodes, workloads);
    let accelerators = AcceleratorSummary::build(nodes, workloads);
    strategy.place(request, nodes, &inventory, &accelerators)
}
