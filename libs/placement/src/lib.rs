//! # cp-placement
//!
//! Resource-aware placement for the computing provider.
//!
//! ## Components
//!
//! - [`Inventory`]: point-in-time remainder capacity per node
//!   (`capacity - sum(claims of workloads scheduled there)`)
//! - [`AcceleratorSummary`]: per-node accelerator slots by normalized product name
//! - [`PlacementStrategy`]: picks a node for a [`ResourceRequest`]; [`FirstFit`] is the default
//!
//! Nothing here caches cluster state. Callers rebuild the inventory and the
//! accelerator summary from a fresh node/workload listing on every decision,
//! and nothing is reserved: two concurrent decisions may pick the same node.
//!
//! ```text
//! nodes + workloads ──► Inventory ─────────┐
//!                   └─► AcceleratorSummary ─┴─► FirstFit::place(request) ─► Placement
//! ```

mod accelerator;
mod engine;
mod error;
mod inventory;
mod quantity;
mod types;

pub use accelerator::{normalize_product, AcceleratorSlots, AcceleratorSummary};
pub use engine::{place, FirstFit, Placement, PlacementStrategy};
pub use error::{NotFoundReason, PlacementError, QuantityError};
pub use inventory::{Inventory, NodeRemainder};
pub use quantity::{parse_cpu, parse_quantity, GIB};
pub use types::{
    AcceleratorClaim, AcceleratorRequest, Architecture, Node, ResourceClaims, ResourceEnvelope,
    ResourceRequest, Resources, Workload,
};
