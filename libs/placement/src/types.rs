//! Cluster-facing data types consumed by the placement engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node label marking an Intel host.
pub const LABEL_INTEL: &str = "INTEL";

/// Node label marking an AMD host.
pub const LABEL_AMD: &str = "AMD";

/// CPU/memory/storage amounts. Memory and storage are bytes, cpu is whole cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
}

impl Resources {
    pub fn new(cpu: i64, memory: i64, storage: i64) -> Self {
        Self {
            cpu,
            memory,
            storage,
        }
    }

    fn scaled(&self, factor: i64) -> Self {
        Self {
            cpu: self.cpu.saturating_mul(factor),
            memory: self.memory.saturating_mul(factor),
            storage: self.storage.saturating_mul(factor),
        }
    }
}

/// Accelerator requirement of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorRequest {
    /// Product name as requested, e.g. `"RTX 3090"`. Normalized before matching.
    pub name: String,
    pub count: i64,
}

/// An immutable resource request built once per incoming task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: i64,
    pub memory: i64,
    pub storage: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<AcceleratorRequest>,
}

impl ResourceRequest {
    pub fn new(cpu: i64, memory: i64, storage: i64) -> Self {
        Self {
            cpu,
            memory,
            storage,
            accelerator: None,
        }
    }

    pub fn with_accelerator(mut self, name: impl Into<String>, count: i64) -> Self {
        self.accelerator = Some(AcceleratorRequest {
            name: name.into(),
            count,
        });
        self
    }

    pub fn resources(&self) -> Resources {
        Resources::new(self.cpu, self.memory, self.storage)
    }
}

/// Requests and limits to apply to a workload's container.
///
/// Requests are the 1x amounts, limits allow a 2x burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub requests: Resources,
    pub limits: Resources,
    /// Accelerator slots, identical for requests and limits.
    pub accelerators: i64,
}

impl ResourceEnvelope {
    /// Burst multiplier applied to every limit.
    pub const BURST_FACTOR: i64 = 2;

    pub fn from_request(request: &ResourceRequest) -> Self {
        let requests = request.resources();
        Self {
            requests,
            limits: requests.scaled(Self::BURST_FACTOR),
            accelerators: request.accelerator.as_ref().map_or(0, |a| a.count),
        }
    }
}

/// CPU architecture tag derived from node labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Architecture {
    Intel,
    Amd,
}

impl Architecture {
    /// Reads the `INTEL`/`AMD` marker label. AMD wins when both are present.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        if labels.contains_key(LABEL_AMD) {
            Some(Self::Amd)
        } else if labels.contains_key(LABEL_INTEL) {
            Some(Self::Intel)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intel => LABEL_INTEL,
            Self::Amd => LABEL_AMD,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable cluster node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Total allocatable capacity.
    pub capacity: Resources,
    /// Accelerator product name -> total slots on this node.
    #[serde(default)]
    pub accelerators: BTreeMap<String, i64>,
}

impl Node {
    pub fn new(name: impl Into<String>, capacity: Resources) -> Self {
        Self {
            name: name.into(),
            capacity,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_accelerator(mut self, product: impl Into<String>, slots: i64) -> Self {
        self.accelerators.insert(product.into(), slots);
        self
    }

    pub fn architecture(&self) -> Option<Architecture> {
        Architecture::from_labels(&self.labels)
    }
}

/// Per-resource claims of a workload. Unset fields count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaims {
    pub cpu: Option<i64>,
    pub memory: Option<i64>,
    pub storage: Option<i64>,
}

impl ResourceClaims {
    pub fn resources(&self) -> Resources {
        Resources::new(
            self.cpu.unwrap_or(0),
            self.memory.unwrap_or(0),
            self.storage.unwrap_or(0),
        )
    }
}

impl From<Resources> for ResourceClaims {
    fn from(r: Resources) -> Self {
        Self {
            cpu: Some(r.cpu),
            memory: Some(r.memory),
            storage: Some(r.storage),
        }
    }
}

/// Accelerator slots held by a running workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorClaim {
    /// Product the workload was pinned to, when known.
    #[serde(default)]
    pub product: Option<String>,
    pub count: i64,
}

/// A running workload (pod) as seen by the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    /// Node the workload is bound to. Unbound workloads claim nothing.
    pub node_name: Option<String>,
    #[serde(default)]
    pub claims: ResourceClaims,
    #[serde(default)]
    pub accelerator: Option<AcceleratorClaim>,
}

impl Workload {
    pub fn on(name: impl Into<String>, node: impl Into<String>, claims: impl Into<ResourceClaims>) -> Self {
        Self {
            name: name.into(),
            node_name: Some(node.into()),
            claims: claims.into(),
            accelerator: None,
        }
    }

    pub fn with_accelerator(mut self, product: Option<&str>, count: i64) -> Self {
        self.accelerator = Some(AcceleratorClaim {
            product: product.map(str::to_string),
            count,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_doubles_limits() {
        let request = ResourceRequest::new(4, 8 << 30, 20 << 30).with_accelerator("A100", 1);
        let envelope = ResourceEnvelope::from_request(&request);
        assert_eq!(envelope.requests, Resources::new(4, 8 << 30, 20 << 30));
        assert_eq!(envelope.limits, Resources::new(8, 16 << 30, 40 << 30));
        assert_eq!(envelope.accelerators, 1);
    }

    #[test]
    fn test_envelope_without_accelerator() {
        let envelope = ResourceEnvelope::from_request(&ResourceRequest::new(1, 1, 1));
        assert_eq!(envelope.accelerators, 0);
    }

    #[test]
    fn test_architecture_from_labels() {
        let node = Node::new("n1", Resources::default()).with_label(LABEL_INTEL, "true");
        assert_eq!(node.architecture(), Some(Architecture::Intel));

        let node = node.with_label(LABEL_AMD, "true");
        assert_eq!(node.architecture(), Some(Architecture::Amd));

        assert_eq!(Node::new("n2", Resources::default()).architecture(), None);
    }

    #[test]
    fn test_unset_claims_are_zero() {
        let claims = ResourceClaims {
            cpu: Some(2),
            memory: None,
            storage: None,
        };
        assert_eq!(claims.resources(), Resources::new(2, 0, 0));
    }
}
