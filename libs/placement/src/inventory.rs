//! Remainder capacity per node.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{Node, ResourceRequest, Resources, Workload};

/// What is left on a node once running workloads are accounted for.
///
/// Values can go negative when the orchestrator admitted more than the node's
/// nominal capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRemainder {
    pub node: String,
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
}

impl NodeRemainder {
    /// Compute `capacity - sum(claims)` for one node.
    pub fn compute(node: &Node, workloads: &[Workload]) -> Self {
        let used = workloads
            .iter()
            .filter(|w| w.node_name.as_deref() == Some(node.name.as_str()))
            .map(|w| w.claims.resources())
            .fold(Resources::default(), |acc, r| Resources {
                cpu: acc.cpu.saturating_add(r.cpu),
                memory: acc.memory.saturating_add(r.memory),
                storage: acc.storage.saturating_add(r.storage),
            });

        Self {
            node: node.name.clone(),
            cpu: node.capacity.cpu.saturating_sub(used.cpu),
            memory: node.capacity.memory.saturating_sub(used.memory),
            storage: node.capacity.storage.saturating_sub(used.storage),
        }
    }

    /// True when every dimension covers the request.
    pub fn fits(&self, request: &ResourceRequest) -> bool {
        self.cpu >= request.cpu && self.memory >= request.memory && self.storage >= request.storage
    }
}

/// A snapshot of remainders for a node listing.
///
/// Only valid for the listing it was built from; rebuild it for every decision.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    remainders: HashMap<String, NodeRemainder>,
}

impl Inventory {
    pub fn snapshot(nodes: &[Node], workloads: &[Workload]) -> Self {
        let remainders = nodes
            .iter()
            .map(|n| (n.name.clone(), NodeRemainder::compute(n, workloads)))
            .collect();
        Self { remainders }
    }

    pub fn remainder(&self, node: &str) -> Option<&NodeRemainder> {
        self.remainders.get(node)
    }

    pub fn len(&self) -> usize {
        self.remainders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remainders.is_empty()
    }
}
