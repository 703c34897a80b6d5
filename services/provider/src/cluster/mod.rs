//! Cluster orchestrator interface.
//!
//! The provider consumes nodes, pods, jobs and namespaces; it does not
//! implement them. [`Cluster`] is the seam, and [`InMemoryCluster`] is the
//! binding used until a real orchestrator client is wired in.

mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use cp_placement::{Node, ResourceEnvelope, Workload};
use serde::Serialize;
use thiserror::Error;

pub use memory::{InMemoryCluster, InMemoryImageBuilder};

/// Label carried by every object belonging to a space.
pub const SPACE_LABEL: &str = "lad_app";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("cluster request failed: {0}")]
    Request(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostPathMount {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
}

/// A run-to-completion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub namespace: String,
    /// Pin to a node chosen by placement.
    pub node_name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub resources: Option<ResourceEnvelope>,
    /// Accelerator product the slots are taken from.
    pub accelerator_product: Option<String>,
    pub mounts: Vec<HostPathMount>,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub node_name: Option<String>,
    pub containers: Vec<ContainerSpec>,
    pub resources: ResourceEnvelope,
    pub accelerator_product: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressSpec {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub service_name: String,
    pub service_port: u16,
}

/// Orchestrator operations the provider relies on.
///
/// Delete calls report [`ClusterError::NotFound`] for missing objects so
/// callers can decide whether that matters.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// Running workloads with their resource claims.
    async fn list_workloads(&self) -> Result<Vec<Workload>, ClusterError>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError>;

    async fn create_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    async fn create_job(&self, job: &JobSpec) -> Result<(), ClusterError>;

    async fn job_status(&self, namespace: &str, name: &str) -> Result<JobStatus, ClusterError>;

    /// Logs of the first pod created by the job.
    async fn job_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError>;

    async fn apply_deployment(&self, deployment: &DeploymentSpec) -> Result<(), ClusterError>;

    async fn apply_service(&self, service: &ServiceSpec) -> Result<(), ClusterError>;

    async fn apply_ingress(&self, ingress: &IngressSpec) -> Result<(), ClusterError>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Image references used by a deployment's containers.
    async fn deployment_images(&self, namespace: &str, name: &str) -> Result<Vec<String>, ClusterError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Delete replica sets labelled with `lad_app=<space_uuid>`.
    async fn delete_replica_sets(&self, namespace: &str, space_uuid: &str) -> Result<(), ClusterError>;

    /// Delete pods labelled with `lad_app=<space_uuid>`.
    async fn delete_pods(&self, namespace: &str, space_uuid: &str) -> Result<(), ClusterError>;

    /// Whether any pod labelled with `lad_app=<space_uuid>` still exists.
    async fn has_pods(&self, namespace: &str, space_uuid: &str) -> Result<bool, ClusterError>;
}

/// Container image build/removal.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `tag` from `dockerfile` with `context` as build context.
    async fn build(&self, context: &std::path::Path, dockerfile: &std::path::Path, tag: &str) -> anyhow::Result<String>;

    async fn remove(&self, image: &str) -> anyhow::Result<()>;
}

/// Create a namespace unless it already exists.
pub async fn ensure_namespace(cluster: &dyn Cluster, namespace: &str) -> Result<(), ClusterError> {
    if cluster.namespace_exists(namespace).await? {
        return Ok(());
    }
    match cluster.create_namespace(namespace).await {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Treat a missing object as success.
pub fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
