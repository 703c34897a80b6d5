//! Accelerator slot summary per node.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::types::{Node, Workload};

/// Normalize an accelerator product name for comparison: uppercase, spaces become hyphens.
pub fn normalize_product(name: &str) -> String {
    name.trim().to_uppercase().replace(' ', "-")
}

/// Total and consumed slots of one product on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcceleratorSlots {
    pub capacity: i64,
    pub used: i64,
}

impl AcceleratorSlots {
    pub fn free(&self) -> i64 {
        self.capacity - self.used
    }

    pub fn admits(&self, count: i64) -> bool {
        self.used.saturating_add(count) <= self.capacity
    }
}

/// Node name -> normalized product -> slots.
///
/// Rebuilt on every placement attempt from a fresh listing.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct AcceleratorSummary {
    nodes: HashMap<String, BTreeMap<String, AcceleratorSlots>>,
}

impl AcceleratorSummary {
    /// Build the summary from node capacities and workload claims.
    ///
    /// A claim that does not name its product is charged to the node's first
    /// product in normalized order.
    pub fn build(nodes: &[Node], workloads: &[Workload]) -> Self {
        let mut summary: HashMap<String, BTreeMap<String, AcceleratorSlots>> = nodes
            .iter()
            .map(|node| {
                let mut products = BTreeMap::new();
                for (product, slots) in &node.accelerators {
                    products
                        .entry(normalize_product(product))
                        .or_insert_with(AcceleratorSlots::default)
                        .capacity += *slots;
                }
                (node.name.clone(), products)
            })
            .collect();

        for workload in workloads {
            let (Some(node), Some(claim)) = (&workload.node_name, &workload.accelerator) else {
                continue;
            };
            if claim.count <= 0 {
                continue;
            }
            let Some(products) = summary.get_mut(node) else {
                continue;
            };

            let key = match &claim.product {
                Some(product) => normalize_product(product),
                None => match products.keys().next() {
                    Some(first) => first.clone(),
                    None => continue,
                },
            };
            products.entry(key).or_default().used += claim.count;
        }

        Self { nodes: summary }
    }

    /// Products on a node, keyed by normalized name.
    pub fn node(&self, node: &str) -> Option<&BTreeMap<String, AcceleratorSlots>> {
        self.nodes.get(node)
    }

    /// First product on `node` whose normalized name contains the normalized
    /// `requested` name and that still has `count` free slots.
    pub fn find_fit(&self, node: &str, requested: &str, count: i64) -> Option<&str> {
        let wanted = normalize_product(requested);
        if wanted.is_empty() {
            return None;
        }
        self.nodes
            .get(node)?
            .iter()
            .find(|(product, slots)| product.contains(&wanted) && slots.admits(count))
            .map(|(product, _)| product.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceClaims, Resources};

    fn gpu_node(name: &str, product: &str, slots: i64) -> Node {
        Node::new(name, Resources::new(8, 8, 8)).with_accelerator(product, slots)
    }

    #[test]
    fn test_normalize_product() {
        assert_eq!(normalize_product("NVIDIA GeForce RTX 3090"), "NVIDIA-GEFORCE-RTX-3090");
        assert_eq!(normalize_product(" a100 "), "A100");
    }

    #[test]
    fn test_used_slots_counted_per_product() {
        let nodes = vec![gpu_node("n1", "NVIDIA RTX 3090", 2)];
        let workloads = vec![
            Workload::on("a", "n1", ResourceClaims::default()).with_accelerator(Some("nvidia rtx 3090"), 1),
            Workload::on("b", "n1", ResourceClaims::default()).with_accelerator(None, 1),
        ];
        let summary = AcceleratorSummary::build(&nodes, &workloads);
        let slots = summary.node("n1").and_then(|p| p.get("NVIDIA-RTX-3090")).copied();
        assert_eq!(slots, Some(AcceleratorSlots { capacity: 2, used: 2 }));
    }

    #[test]
    fn test_find_fit_matches_by_substring() {
        let nodes = vec![gpu_node("n1", "NVIDIA RTX 3090", 2)];
        let summary = AcceleratorSummary::build(&nodes, &[]);
        assert_eq!(summary.find_fit("n1", "rtx 3090", 1), Some("NVIDIA-RTX-3090"));
        assert_eq!(summary.find_fit("n1", "3090", 2), Some("NVIDIA-RTX-3090"));
        assert_eq!(summary.find_fit("n1", "3090", 3), None);
        assert_eq!(summary.find_fit("n1", "A100", 1), None);
        assert_eq!(summary.find_fit("n1", "", 1), None);
    }

    #[test]
    fn test_exhausted_product_rejected() {
        let nodes = vec![gpu_node("n1", "RTX-3090", 2)];
        let workloads = vec![Workload::on("a", "n1", ResourceClaims::default()).with_accelerator(Some("RTX-3090"), 2)];
        let summary = AcceleratorSummary::build(&nodes, &workloads);
        assert_eq!(summary.find_fit("n1", "RTX-3090", 1), None);
    }
}
