//! In-memory cluster for development and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cp_placement::{AcceleratorClaim, Node, ResourceClaims, ResourceEnvelope, Workload};
use tracing::{debug, info};

use super::{
    Cluster, ClusterError, DeploymentSpec, ImageBuilder, IngressSpec, JobSpec, JobStatus, ServiceSpec, SPACE_LABEL,
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Clone)]
struct Pod {
    namespace: String,
    labels: BTreeMap<String, String>,
    running: bool,
    workload: Workload,
}

#[derive(Debug, Clone)]
struct JobEntry {
    spec: JobSpec,
    status: JobStatus,
    logs: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: Vec<Node>,
    namespaces: BTreeSet<String>,
    pods: Vec<Pod>,
    jobs: BTreeMap<Key, JobEntry>,
    deployments: BTreeMap<Key, DeploymentSpec>,
    replica_sets: BTreeMap<Key, BTreeMap<String, String>>,
    services: BTreeMap<Key, ServiceSpec>,
    ingresses: BTreeMap<Key, IngressSpec>,
}

impl ClusterState {
    fn require_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        if self.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ClusterError::not_found("namespace", namespace))
        }
    }
}

/// Cluster state held in process memory.
///
/// Jobs stay active until [`InMemoryCluster::set_job_status`] is called,
/// unless [`InMemoryCluster::complete_jobs_with`] was used.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    fail_jobs: AtomicBool,
    sticky_pods: AtomicBool,
    completed_logs: Mutex<Option<String>>,
}

fn claims_of(resources: Option<&ResourceEnvelope>, product: Option<&str>) -> (ResourceClaims, Option<AcceleratorClaim>) {
    let Some(envelope) = resources else {
        return (ResourceClaims::default(), None);
    };
    let accelerator = (envelope.accelerators > 0).then(|| AcceleratorClaim {
        product: product.map(str::to_string),
        count: envelope.accelerators,
    });
    (envelope.requests.into(), accelerator)
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let cluster = Self::new();
        if let Ok(mut state) = cluster.state.lock() {
            state.nodes = nodes;
        }
        cluster
    }

    fn lock(&self) -> Result<MutexGuard<'_, ClusterState>, ClusterError> {
        self.state
            .lock()
            .map_err(|_| ClusterError::Request("cluster state lock poisoned".to_string()))
    }

    pub fn add_node(&self, node: Node) {
        if let Ok(mut state) = self.state.lock() {
            state.nodes.push(node);
        }
    }

    /// Register a running workload that was not created through this API.
    pub fn add_workload(&self, namespace: &str, workload: Workload) {
        if let Ok(mut state) = self.state.lock() {
            state.namespaces.insert(namespace.to_string());
            state.pods.push(Pod {
                namespace: namespace.to_string(),
                labels: BTreeMap::new(),
                running: true,
                workload,
            });
        }
    }

    /// Make every subsequent job creation fail.
    pub fn fail_job_creation(&self, fail: bool) {
        self.fail_jobs.store(fail, Ordering::SeqCst);
    }

    /// Keep pods around after they are deleted, as if they never terminate.
    pub fn keep_pods_after_delete(&self, sticky: bool) {
        self.sticky_pods.store(sticky, Ordering::SeqCst);
    }

    /// Jobs created from now on succeed immediately and report `logs`.
    pub fn complete_jobs_with(&self, logs: impl Into<String>) {
        if let Ok(mut slot) = self.completed_logs.lock() {
            *slot = Some(logs.into());
        }
    }

    pub fn set_job_status(&self, namespace: &str, name: &str, status: JobStatus, logs: &str) {
        if let Ok(mut state) = self.state.lock() {
            let finished = status.active == 0;
            if let Some(job) = state.jobs.get_mut(&key(namespace, name)) {
                job.status = status;
                job.logs = logs.to_string();
            }
            if finished {
                for pod in state.pods.iter_mut() {
                    if pod.namespace == namespace && pod.labels.get("job-name").map(String::as_str) == Some(name) {
                        pod.running = false;
                    }
                }
            }
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.namespaces.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.state
            .lock()
            .map(|s| s.jobs.values().map(|j| j.spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<DeploymentSpec> {
        self.state.lock().ok()?.deployments.get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<ServiceSpec> {
        self.state.lock().ok()?.services.get(&key(namespace, name)).cloned()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<IngressSpec> {
        self.state.lock().ok()?.ingresses.get(&key(namespace, name)).cloned()
    }

    pub fn pod_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.pods.iter().filter(|p| p.namespace == namespace).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.lock()?.nodes.clone())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, ClusterError> {
        Ok(self
            .lock()?
            .pods
            .iter()
            .filter(|p| p.running)
            .map(|p| p.workload.clone())
            .collect())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(self.lock()?.namespaces.contains(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        if !state.namespaces.insert(namespace.to_string()) {
            return Err(ClusterError::already_exists("namespace", namespace));
        }
        debug!(namespace = %namespace, "[MEMORY] Namespace created");
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        if !state.namespaces.remove(namespace) {
            return Err(ClusterError::not_found("namespace", namespace));
        }
        state.pods.retain(|p| p.namespace != namespace);
        state.jobs.retain(|(ns, _), _| ns != namespace);
        state.deployments.retain(|(ns, _), _| ns != namespace);
        state.replica_sets.retain(|(ns, _), _| ns != namespace);
        state.services.retain(|(ns, _), _| ns != namespace);
        state.ingresses.retain(|(ns, _), _| ns != namespace);
        info!(namespace = %namespace, "[MEMORY] Namespace deleted");
        Ok(())
    }

    async fn create_job(&self, job: &JobSpec) -> Result<(), ClusterError> {
        if self.fail_jobs.load(Ordering::SeqCst) {
            return Err(ClusterError::Request(format!("job '{}' rejected", job.name)));
        }
        let completed = self.completed_logs.lock().ok().and_then(|s| s.clone());

        let mut state = self.lock()?;
        state.require_namespace(&job.namespace)?;
        let k = key(&job.namespace, &job.name);
        if state.jobs.contains_key(&k) {
            return Err(ClusterError::already_exists("job", &job.name));
        }

        let (claims, accelerator) = claims_of(job.resources.as_ref(), job.accelerator_product.as_deref());
        state.pods.push(Pod {
            namespace: job.namespace.clone(),
            labels: BTreeMap::from([("job-name".to_string(), job.name.clone())]),
            running: completed.is_none(),
            workload: Workload {
                name: format!("{}-pod", job.name),
                node_name: job.node_name.clone(),
                claims,
                accelerator,
            },
        });

        let (status, logs) = match completed {
            Some(logs) => (
                JobStatus {
                    succeeded: 1,
                    ..Default::default()
                },
                logs,
            ),
            None => (
                JobStatus {
                    active: 1,
                    ..Default::default()
                },
                String::new(),
            ),
        };
        state.jobs.insert(
            k,
            JobEntry {
                spec: job.clone(),
                status,
                logs,
            },
        );
        info!(namespace = %job.namespace, job = %job.name, node = ?job.node_name, "[MEMORY] Job created");
        Ok(())
    }

    async fn job_status(&self, namespace: &str, name: &str) -> Result<JobStatus, ClusterError> {
        self.lock()?
            .jobs
            .get(&key(namespace, name))
            .map(|j| j.status)
            .ok_or_else(|| ClusterError::not_found("job", name))
    }

    async fn job_logs(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        self.lock()?
            .jobs
            .get(&key(namespace, name))
            .map(|j| j.logs.clone())
            .ok_or_else(|| ClusterError::not_found("pod", format!("{name}-pod")))
    }

    async fn apply_deployment(&self, deployment: &DeploymentSpec) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        state.require_namespace(&deployment.namespace)?;

        let k = key(&deployment.namespace, &deployment.name);
        let pod_name = format!("{}-pod", deployment.name);
        state
            .pods
            .retain(|p| !(p.namespace == deployment.namespace && p.workload.name == pod_name));
        let (claims, accelerator) = claims_of(Some(&deployment.resources), deployment.accelerator_product.as_deref());
        state.pods.push(Pod {
            namespace: deployment.namespace.clone(),
            labels: deployment.labels.clone(),
            running: true,
            workload: Workload {
                name: pod_name,
                node_name: deployment.node_name.clone(),
                claims,
                accelerator,
            },
        });
        state
            .replica_sets
            .insert(key(&deployment.namespace, &format!("{}-rs", deployment.name)), deployment.labels.clone());
        state.deployments.insert(k, deployment.clone());
        info!(namespace = %deployment.namespace, deployment = %deployment.name, "[MEMORY] Deployment applied");
        Ok(())
    }

    async fn apply_service(&self, service: &ServiceSpec) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        state.require_namespace(&service.namespace)?;
        state
            .services
            .insert(key(&service.namespace, &service.name), service.clone());
        Ok(())
    }

    async fn apply_ingress(&self, ingress: &IngressSpec) -> Result<(), ClusterError> {
        let mut state = self.lock()?;
        state.require_namespace(&ingress.namespace)?;
        state
            .ingresses
            .insert(key(&ingress.namespace, &ingress.name), ingress.clone());
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.lock()?
            .ingresses
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("ingress", name))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.lock()?
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("service", name))
    }

    async fn deployment_images(&self, namespace: &str, name: &str) -> Result<Vec<String>, ClusterError> {
        self.lock()?
            .deployments
            .get(&key(namespace, name))
            .map(|d| d.containers.iter().map(|c| c.image.clone()).collect())
            .ok_or_else(|| ClusterError::not_found("deployment", name))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.lock()?
            .deployments
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("deployment", name))
    }

    async fn delete_replica_sets(&self, namespace: &str, space_uuid: &str) -> Result<(), ClusterError> {
        self.lock()?.replica_sets.retain(|(ns, _), labels| {
            !(ns == namespace && labels.get(SPACE_LABEL).map(String::as_str) == Some(space_uuid))
        });
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str, space_uuid: &str) -> Result<(), ClusterError> {
        if self.sticky_pods.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.lock()?.pods.retain(|p| {
            !(p.namespace == namespace && p.labels.get(SPACE_LABEL).map(String::as_str) == Some(space_uuid))
        });
        Ok(())
    }

    async fn has_pods(&self, namespace: &str, space_uuid: &str) -> Result<bool, ClusterError> {
        Ok(self
            .lock()?
            .pods
            .iter()
            .any(|p| p.namespace == namespace && p.labels.get(SPACE_LABEL).map(String::as_str) == Some(space_uuid)))
    }
}

/// Image builder that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct InMemoryImageBuilder {
    images: Mutex<BTreeSet<String>>,
    fail_builds: AtomicBool,
}

impl InMemoryImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_builds: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn images(&self) -> Vec<String> {
        self.images
            .lock()
            .map(|i| i.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageBuilder for InMemoryImageBuilder {
    async fn build(&self, context: &Path, dockerfile: &Path, tag: &str) -> anyhow::Result<String> {
        if self.fail_builds.load(Ordering::SeqCst) {
            anyhow::bail!("image build for '{tag}' failed");
        }
        if !dockerfile.exists() {
            anyhow::bail!("dockerfile {} not found", dockerfile.display());
        }
        info!(context = %context.display(), tag = %tag, "[MEMORY] Image built");
        self.images
            .lock()
            .map_err(|_| anyhow::anyhow!("image registry lock poisoned"))?
            .insert(tag.to_string());
        Ok(tag.to_string())
    }

    async fn remove(&self, image: &str) -> anyhow::Result<()> {
        self.images
            .lock()
            .map_err(|_| anyhow::anyhow!("image registry lock poisoned"))?
            .remove(image);
        Ok(())
    }
}
