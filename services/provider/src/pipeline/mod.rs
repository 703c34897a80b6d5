//! Space deployment pipeline.
//!
//! A space request is checked against cluster capacity before it is
//! accepted. Download, build and apply then run in a detached unit keyed by
//! the space uuid, reporting each stage to the hub. A failed deployment is
//! rolled back; cancel and expiry roll back through the same routine.

pub mod expiry;
pub mod hardware;
pub mod names;
pub mod rollback;
pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use cp_authz::{ensure_signed_by, Framing};
use cp_placement::{place, Placement, PlacementStrategy, ResourceEnvelope};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{
    ensure_namespace, Cluster, ContainerSpec, DeploymentSpec, ImageBuilder, IngressSpec, ServiceSpec, SPACE_LABEL,
};
use crate::error::ProviderError;
use crate::model::SpaceDeployment;
use crate::reporter::{DeployStage, StatusEvent, StatusSender};
use crate::store::TaskStore;
use crate::units::{CancelSignal, DetachedUnits};

pub use expiry::{ExpiryWorker, ExpiryWorkerConfig};
pub use hardware::Hardware;
pub use rollback::{rollback, RollbackConfig, RollbackReport};
pub use source::{DeployMode, SourceFetcher, SpaceDescriptor, SpaceManifest};

/// Port a space listens on unless its manifest or Dockerfile says otherwise.
pub const DEFAULT_SPACE_PORT: u16 = 7860;

const LOG_PATH: &str = "/api/v1/computing/lagrange/spaces/log";

/// Space job as exchanged with the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceJob {
    pub uuid: String,
    pub name: String,
    pub status: String,
    /// Lease length in seconds.
    pub duration: i64,
    pub job_source_uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job_result_uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_source: String,
    pub task_uuid: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_log: String,
    pub container_log: String,
    pub node_id_job_source_uri_signature: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub node_id: String,
    /// Multiaddr of this provider; its fourth segment is the public port.
    pub multi_address: String,
    /// Public domain spaces are served under. A leading `.` is kept.
    pub domain: String,
    /// Hub address whose signature authorizes space jobs.
    pub hub_address: String,
    pub verify_sign: bool,
    pub data_dir: PathBuf,
    /// Image serving model-inference spaces.
    pub inference_image: String,
    pub rollback: RollbackConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Extended { expire_time: i64 },
    /// The lease had already run out; nothing was changed.
    Expired,
}

#[derive(Debug, Clone)]
struct DeployPlan {
    job_uuid: String,
    task_uuid: String,
    duration: i64,
    host: String,
    descriptor: SpaceDescriptor,
    hardware: Hardware,
    placement: Placement,
}

#[derive(Clone)]
pub struct SpacePipeline {
    config: Arc<PipelineConfig>,
    store: TaskStore,
    cluster: Arc<dyn Cluster>,
    builder: Arc<dyn ImageBuilder>,
    strategy: Arc<dyn PlacementStrategy>,
    fetcher: SourceFetcher,
    status: StatusSender,
    units: DetachedUnits<bool>,
}

impl SpacePipeline {
    pub fn new(
        config: PipelineConfig,
        store: TaskStore,
        cluster: Arc<dyn Cluster>,
        builder: Arc<dyn ImageBuilder>,
        strategy: Arc<dyn PlacementStrategy>,
        status: StatusSender,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            store,
            cluster,
            builder,
            strategy,
            fetcher: SourceFetcher::new().context("space source client")?,
            status,
            units: DetachedUnits::new(),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Deploy units are keyed by space uuid, rollbacks by `rollback-<uuid>`.
    pub fn units(&self) -> &DetachedUnits<bool> {
        &self.units
    }

    /// Accept a new space job.
    ///
    /// Returns the job with its public URL and log stream URLs filled in.
    #[instrument(skip(self, job), fields(task_uuid = %job.task_uuid))]
    pub async fn receive(&self, mut job: SpaceJob) -> Result<SpaceJob, ProviderError> {
        required(&job.job_source_uri, "job_source_uri")?;

        if self.config.verify_sign {
            let signature = job.node_id_job_source_uri_signature.trim();
            if signature.is_empty() {
                return Err(ProviderError::validation(
                    "missing node_id_job_source_uri_signature field",
                ));
            }
            let message = format!("{}{}", self.config.node_id, job.job_source_uri);
            ensure_signed_by(
                &self.config.hub_address,
                message.as_bytes(),
                signature,
                Framing::PersonalSign,
            )
            .inspect_err(|e| warn!(task_uuid = %job.task_uuid, error = %e, "Space job signature rejected"))?;
        }

        let (descriptor, hardware, placement) = self.check_capacity(&job).await?;
        let host = names::generate_host(&self.config.domain);
        self.schedule(&job, descriptor, hardware, placement, host.clone())?;

        let space_uuid = names::space_uuid_from_source(&job.job_source_uri);
        job.job_result_uri = format!("https://{host}");
        job.build_log = self.log_url(&space_uuid, "build");
        job.container_log = self.log_url(&space_uuid, "container");
        Ok(job)
    }

    /// Deploy a space again, keeping its public host when the hub knows it.
    #[instrument(skip(self, job), fields(task_uuid = %job.task_uuid))]
    pub async fn redeploy(&self, mut job: SpaceJob) -> Result<SpaceJob, ProviderError> {
        required(&job.job_source_uri, "job_source_uri")?;

        let (descriptor, hardware, placement) = self.check_capacity(&job).await?;
        let host = if job.job_result_uri.trim().is_empty() {
            names::generate_host(&self.config.domain)
        } else {
            self.fetcher
                .result_host(job.job_result_uri.trim())
                .await
                .map_err(|e| ProviderError::upstream(format!("{e:#}")))?
        };

        let space_uuid = descriptor.space_uuid();
        if self.units.cancel(&space_uuid) {
            debug!(space_uuid = %space_uuid, "Waiting for the previous deployment to stop");
            let _ = self.units.join(&space_uuid).await;
        }
        self.schedule(&job, descriptor, hardware, placement, host.clone())?;

        job.job_result_uri = format!("https://{host}");
        Ok(job)
    }

    /// Extend a space's lease by `duration` seconds, unless it already ran out.
    pub fn renew(&self, task_uuid: &str, duration: i64, now: i64) -> Result<RenewOutcome, ProviderError> {
        let task_uuid = required(task_uuid, "task_uuid")?;
        if duration == 0 {
            return Err(ProviderError::validation("missing required field: duration"));
        }
        if duration < 0 {
            return Err(ProviderError::validation("duration must be positive"));
        }

        let mut space = self
            .store
            .space_by_task(task_uuid)?
            .ok_or_else(|| ProviderError::not_found(format!("no space for task {task_uuid}")))?;

        let left = space.left_seconds(now);
        if left < 0 {
            info!(task_uuid = %task_uuid, space_uuid = %space.space_uuid, "Renew refused, space expired");
            return Ok(RenewOutcome::Expired);
        }

        space.expire_time = now + left + duration;
        self.store.save_space(&space)?;
        info!(
            task_uuid = %task_uuid,
            space_uuid = %space.space_uuid,
            expire_time = space.expire_time,
            "Space lease extended"
        );
        Ok(RenewOutcome::Extended {
            expire_time: space.expire_time,
        })
    }

    /// Tear a space down in the background.
    ///
    /// Returns whether a space was found. The record itself is kept.
    pub fn cancel(&self, task_uuid: &str) -> Result<bool, ProviderError> {
        let task_uuid = task_uuid.trim();
        if task_uuid.is_empty() {
            return Err(ProviderError::validation("task_uuid is required"));
        }
        let Some(space) = self.store.space_by_task(task_uuid)? else {
            debug!(task_uuid = %task_uuid, "Cancel for unknown space");
            return Ok(false);
        };

        self.units.cancel(&space.space_uuid);
        let this = self.clone();
        let key = format!("rollback-{}", space.space_uuid);
        let scheduled = self.units.spawn(key, move |_| async move {
            let _ = this.units.join(&space.space_uuid).await;
            this.teardown(&space).await.drained
        });
        if scheduled {
            info!(task_uuid = %task_uuid, "Space cancellation scheduled");
        } else {
            debug!(task_uuid = %task_uuid, "Space rollback already running");
        }
        Ok(true)
    }

    /// Roll back and forget every space whose lease ended before `now`.
    /// Returns the uuids removed.
    pub async fn expire_due(&self, now: i64) -> Result<Vec<String>, ProviderError> {
        let mut expired = Vec::new();
        for space in self.store.spaces()?.into_iter().filter(|s| s.left_seconds(now) < 0) {
            info!(space_uuid = %space.space_uuid, expire_time = space.expire_time, "Space lease expired");
            if self.units.cancel(&space.space_uuid) {
                let _ = self.units.join(&space.space_uuid).await;
            }
            self.teardown(&space).await;
            match self.store.delete_space(&space.space_uuid) {
                Ok(_) => expired.push(space.space_uuid),
                Err(e) => error!(space_uuid = %space.space_uuid, error = %e, "Failed to delete space record"),
            }
        }
        Ok(expired)
    }

    async fn teardown(&self, space: &SpaceDeployment) -> RollbackReport {
        rollback(
            self.cluster.as_ref(),
            self.builder.as_ref(),
            &space.namespace(),
            &space.space_uuid,
            &self.config.rollback,
        )
        .await
    }

    async fn check_capacity(&self, job: &SpaceJob) -> Result<(SpaceDescriptor, Hardware, Placement), ProviderError> {
        let descriptor = self
            .fetcher
            .descriptor(&job.job_source_uri)
            .await
            .map_err(|e| ProviderError::upstream(format!("{e:#}")))?;
        let hardware = Hardware::parse(descriptor.hardware_description())?;

        let nodes = self.cluster.list_nodes().await?;
        let workloads = self.cluster.list_workloads().await?;
        let placement = place(self.strategy.as_ref(), &hardware.request(), &nodes, &workloads).inspect_err(|e| {
            warn!(
                task_uuid = %job.task_uuid,
                space = %descriptor.space_name(),
                reason = ?e.reason(),
                "No node available for space"
            )
        })?;
        debug!(space_uuid = %descriptor.space_uuid(), node = %placement.node, "Space placed");
        Ok((descriptor, hardware, placement))
    }

    fn schedule(
        &self,
        job: &SpaceJob,
        descriptor: SpaceDescriptor,
        hardware: Hardware,
        placement: Placement,
        host: String,
    ) -> Result<(), ProviderError> {
        let space_uuid = descriptor.space_uuid();
        let plan = DeployPlan {
            job_uuid: job.uuid.clone(),
            task_uuid: job.task_uuid.clone(),
            duration: job.duration,
            host,
            descriptor,
            hardware,
            placement,
        };

        let this = self.clone();
        if !self
            .units
            .spawn(space_uuid.clone(), move |cancel| this.deploy(plan, cancel))
        {
            return Err(ProviderError::validation(format!(
                "space {space_uuid} is already being deployed"
            )));
        }
        info!(space_uuid = %space_uuid, job_uuid = %job.uuid, "Space deployment scheduled");
        Ok(())
    }

    fn report(&self, job_uuid: &str, stage: DeployStage) {
        self.status.report(StatusEvent::new(job_uuid, stage));
    }

    fn log_url(&self, space_uuid: &str, kind: &str) -> String {
        let log_host = names::host("log", &self.config.domain);
        let port = self.config.multi_address.split('/').nth(4).unwrap_or_default();
        format!("wss://{log_host}:{port}{LOG_PATH}?space_id={space_uuid}&type={kind}")
    }

    /// Detached part of a deployment. Returns whether the space is up.
    async fn deploy(self, plan: DeployPlan, mut cancel: CancelSignal) -> bool {
        let space_uuid = plan.descriptor.space_uuid();
        self.report(&plan.job_uuid, DeployStage::UploadResult);

        let result = tokio::select! {
            result = self.apply(&plan) => result,
            _ = cancel.cancelled() => {
                warn!(space_uuid = %space_uuid, "Space deployment cancelled");
                return false;
            }
        };

        match result {
            Ok(()) => {
                info!(space_uuid = %space_uuid, host = %plan.host, node = %plan.placement.node, "Space deployed");
                self.status.report(
                    StatusEvent::new(&plan.job_uuid, DeployStage::Deployed).with_url(format!("https://{}", plan.host)),
                );
                true
            }
            Err(e) => {
                error!(space_uuid = %space_uuid, error = %e, "Space deployment failed");
                self.report(&plan.job_uuid, DeployStage::Failed);
                let namespace = names::namespace(plan.descriptor.wallet_address());
                rollback(
                    self.cluster.as_ref(),
                    self.builder.as_ref(),
                    &namespace,
                    &space_uuid,
                    &self.config.rollback,
                )
                .await;
                false
            }
        }
    }

    async fn apply(&self, plan: &DeployPlan) -> Result<(), ProviderError> {
        let descriptor = &plan.descriptor;
        let space_uuid = descriptor.space_uuid();
        let record = SpaceDeployment {
            wallet_address: descriptor.wallet_address().to_string(),
            space_name: descriptor.space_name().to_string(),
            expire_time: Utc::now().timestamp() + plan.duration,
            space_uuid: space_uuid.clone(),
            job_uuid: plan.job_uuid.clone(),
            task_type: plan.hardware.kind.as_str().to_string(),
            deploy_name: names::deployment(&space_uuid),
            hardware: descriptor.hardware_description().to_string(),
            task_uuid: plan.task_uuid.clone(),
        };
        self.store.save_space(&record)?;
        let namespace = record.namespace();

        self.report(&plan.job_uuid, DeployStage::DownloadSource);
        let dir = source::space_dir(&self.config.data_dir, &record.wallet_address, &record.space_name)
            .map_err(|e| ProviderError::validation(format!("{e:#}")))?;
        let files = self
            .fetcher
            .download(descriptor, &dir)
            .await
            .map_err(|e| ProviderError::upstream(format!("{e:#}")))?;
        let mode = source::detect_mode(&dir, &files)
            .ok_or_else(|| ProviderError::validation("space has no model settings, manifest or Dockerfile"))?;

        ensure_namespace(self.cluster.as_ref(), &namespace).await?;
        let (containers, port) = self.containers(plan, &record, &dir, mode).await?;

        let labels = BTreeMap::from([(SPACE_LABEL.to_string(), space_uuid.clone())]);
        self.cluster
            .apply_deployment(&DeploymentSpec {
                name: record.deploy_name.clone(),
                namespace: namespace.clone(),
                labels: labels.clone(),
                node_name: Some(plan.placement.node.clone()),
                containers,
                resources: ResourceEnvelope::from_request(&plan.hardware.request()),
                accelerator_product: plan.placement.accelerator_product.clone(),
            })
            .await?;
        self.cluster
            .apply_service(&ServiceSpec {
                name: names::service(&space_uuid),
                namespace: namespace.clone(),
                selector: labels,
                port,
            })
            .await?;
        self.cluster
            .apply_ingress(&IngressSpec {
                name: names::ingress(&space_uuid),
                namespace,
                host: plan.host.clone(),
                service_name: names::service(&space_uuid),
                service_port: port,
            })
            .await?;
        Ok(())
    }

    async fn containers(
        &self,
        plan: &DeployPlan,
        record: &SpaceDeployment,
        dir: &Path,
        mode: DeployMode,
    ) -> Result<(Vec<ContainerSpec>, u16), ProviderError> {
        match mode {
            DeployMode::ModelInference { settings } => {
                self.report(&plan.job_uuid, DeployStage::ModelInference);
                let settings = read_artifact(&settings).await?;
                serde_json::from_str::<serde_json::Value>(&settings)
                    .map_err(|e| ProviderError::validation(format!("invalid model settings: {e}")))?;
                let container = ContainerSpec {
                    name: "model".to_string(),
                    image: self.config.inference_image.clone(),
                    command: Vec::new(),
                    env: vec![("MODEL_SETTINGS".to_string(), settings)],
                    ports: vec![DEFAULT_SPACE_PORT],
                };
                Ok((vec![container], DEFAULT_SPACE_PORT))
            }
            DeployMode::Manifest { path } => {
                self.report(&plan.job_uuid, DeployStage::YamlDeploy);
                let manifest = SpaceManifest::parse(&read_artifact(&path).await?)
                    .map_err(|e| ProviderError::validation(format!("{e:#}")))?;
                let port = manifest
                    .containers
                    .iter()
                    .find_map(|c| c.ports.first().copied())
                    .unwrap_or(DEFAULT_SPACE_PORT);
                let containers = manifest
                    .containers
                    .into_iter()
                    .map(|c| ContainerSpec {
                        name: c.name,
                        image: c.image,
                        command: c.command,
                        env: c.env.into_iter().collect(),
                        ports: c.ports,
                    })
                    .collect();
                Ok((containers, port))
            }
            DeployMode::Dockerfile { path } => {
                self.report(&plan.job_uuid, DeployStage::DockerfileDeploy);
                let port = source::exposed_port(&read_artifact(&path).await?).unwrap_or(DEFAULT_SPACE_PORT);
                let tag = names::image_tag(&record.space_name, &record.space_uuid);
                let context = path.parent().unwrap_or(dir);
                let image = self
                    .builder
                    .build(context, &path, &tag)
                    .await
                    .map_err(|e| ProviderError::placement(format!("building image {tag}: {e:#}")))?;
                let container = ContainerSpec {
                    name: "app".to_string(),
                    image,
                    command: Vec::new(),
                    env: Vec::new(),
                    ports: vec![port],
                };
                Ok((vec![container], port))
            }
        }
    }
}

async fn read_artifact(path: &Path) -> Result<String, ProviderError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ProviderError::validation(format!("reading {}: {e}", path.display())))
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ProviderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProviderError::validation(format!("missing required field: {field}")));
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, InMemoryImageBuilder};
    use crate::reporter::StatusReporter;
    use cp_authz::{address_of, sign, SigningKey};
    use cp_placement::{FirstFit, Node, Resources, GIB};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NODE_ID: &str = "node-abc";

    pub(crate) struct Harness {
        pub(crate) pipeline: SpacePipeline,
        pub(crate) cluster: Arc<InMemoryCluster>,
        pub(crate) builder: Arc<InMemoryImageBuilder>,
        pub(crate) reporter: StatusReporter,
        pub(crate) hub: SigningKey,
        _data: tempfile::TempDir,
    }

    fn harness_with(verify_sign: bool, builder: InMemoryImageBuilder) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let hub = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let cluster = Arc::new(InMemoryCluster::with_nodes(vec![Node::new(
            "worker-1",
            Resources::new(16, 64 * GIB, 500 * GIB),
        )
        .with_label("INTEL", "true")
        .with_accelerator("NVIDIA 3090", 2)]));
        let builder = Arc::new(builder);
        let (sender, reporter) = StatusReporter::channel(None, 64);

        let pipeline = SpacePipeline::new(
            PipelineConfig {
                node_id: NODE_ID.into(),
                multi_address: "/ip4/10.0.0.1/tcp/8085".into(),
                domain: ".example.org".into(),
                hub_address: address_of(&hub).to_string(),
                verify_sign,
                data_dir: data.path().to_path_buf(),
                inference_image: "lagrange/inference:v1".into(),
                rollback: RollbackConfig {
                    poll_interval: Duration::from_millis(1),
                    max_polls: 3,
                },
            },
            TaskStore::in_memory(),
            cluster.clone(),
            builder.clone(),
            Arc::new(FirstFit),
            sender,
        )
        .unwrap();

        Harness {
            pipeline,
            cluster,
            builder,
            reporter,
            hub,
            _data: data,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(false, InMemoryImageBuilder::new())
    }

    /// Hub serving a space `UUID-1` named `demo` owned by `0xABC`.
    async fn space_server(files: &[(&str, &str)], hardware: &str) -> MockServer {
        let server = MockServer::start().await;
        let listed: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(i, (name, _))| serde_json::json!({ "name": name, "url": format!("{}/files/{i}", server.uri()) }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/spaces/UUID-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "files": listed,
                    "owner": { "public_address": "0xABC" },
                    "space": {
                        "uuid": "UUID-1",
                        "name": "demo",
                        "activeOrder": { "config": { "description": hardware } }
                    }
                }
            })))
            .mount(&server)
            .await;
        for (i, (_, content)) in files.iter().enumerate() {
            Mock::given(method("GET"))
                .and(path(format!("/files/{i}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(*content))
                .mount(&server)
                .await;
        }
        server
    }

    fn job(server: &MockServer) -> SpaceJob {
        SpaceJob {
            uuid: "job-1".into(),
            name: "demo".into(),
            duration: 3600,
            job_source_uri: format!("{}/spaces/UUID-1", server.uri()),
            task_uuid: "task-1".into(),
            ..Default::default()
        }
    }

    const CPU_SPACE: &str = "CPU only · 2 vCPU · 4 GiB";

    async fn deployed(h: &Harness) -> bool {
        h.pipeline.units().join("uuid-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_dockerfile_space_deploys() {
        let mut h = harness();
        let server = space_server(
            &[("Dockerfile", "FROM python:3.11\nEXPOSE 8080\n"), ("app.py", "print('hi')\n")],
            CPU_SPACE,
        )
        .await;

        let response = h.pipeline.receive(job(&server)).await.unwrap();
        let host = response.job_result_uri.strip_prefix("https://").unwrap().to_string();
        assert!(host.ends_with(".example.org"));
        assert_eq!(
            response.build_log,
            "wss://log.example.org:8085/api/v1/computing/lagrange/spaces/log?space_id=uuid-1&type=build"
        );
        assert!(response.container_log.ends_with("&type=container"));
        assert!(deployed(&h).await);

        let deployment = h.cluster.deployment("ns-0xabc", "deploy-uuid-1").unwrap();
        assert_eq!(deployment.node_name.as_deref(), Some("worker-1"));
        assert_eq!(deployment.containers[0].image, "lagrange/demo:uuid-1");
        assert_eq!(deployment.labels.get(SPACE_LABEL).map(String::as_str), Some("uuid-1"));
        assert_eq!(h.cluster.service("ns-0xabc", "svc-uuid-1").unwrap().port, 8080);
        assert_eq!(h.cluster.ingress("ns-0xabc", "ing-uuid-1").unwrap().host, host);
        assert_eq!(h.builder.images(), vec!["lagrange/demo:uuid-1".to_string()]);

        let record = h.pipeline.store().space("uuid-1").unwrap().unwrap();
        assert_eq!(record.task_uuid, "task-1");
        assert_eq!(record.task_type, "CPU");
        assert_eq!(record.deploy_name, "deploy-uuid-1");
        assert!(record.left_seconds(Utc::now().timestamp()) > 3500);

        let events = h.reporter.drain();
        let stages: Vec<_> = events.iter().map(|e| e.stage).collect();
        assert_eq!(
            stages,
            vec![
                DeployStage::UploadResult,
                DeployStage::DownloadSource,
                DeployStage::DockerfileDeploy,
                DeployStage::Deployed
            ]
        );
        assert_eq!(events[3].url, response.job_result_uri);
    }

    #[tokio::test]
    async fn test_model_settings_take_precedence() {
        let h = harness();
        let server = space_server(
            &[("Dockerfile", "FROM scratch\n"), ("model-setting.json", r#"{"model":"llama"}"#)],
            CPU_SPACE,
        )
        .await;

        h.pipeline.receive(job(&server)).await.unwrap();
        assert!(deployed(&h).await);

        let deployment = h.cluster.deployment("ns-0xabc", "deploy-uuid-1").unwrap();
        assert_eq!(deployment.containers[0].image, "lagrange/inference:v1");
        assert_eq!(
            deployment.containers[0].env,
            vec![("MODEL_SETTINGS".to_string(), r#"{"model":"llama"}"#.to_string())]
        );
        assert!(h.builder.images().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_space_deploys_listed_containers() {
        let h = harness();
        let manifest = "containers:\n  - name: web\n    image: nginx:1.25\n    ports: [80]\n";
        let server = space_server(&[("deploy.yaml", manifest), ("Dockerfile", "FROM scratch\n")], CPU_SPACE).await;

        h.pipeline.receive(job(&server)).await.unwrap();
        assert!(deployed(&h).await);

        let deployment = h.cluster.deployment("ns-0xabc", "deploy-uuid-1").unwrap();
        assert_eq!(deployment.containers[0].image, "nginx:1.25");
        assert_eq!(h.cluster.service("ns-0xabc", "svc-uuid-1").unwrap().port, 80);
    }

    #[tokio::test]
    async fn test_gpu_space_takes_an_accelerator_slot() {
        let h = harness();
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], "NVIDIA 3090 · 4 vCPU · 8 GiB").await;

        h.pipeline.receive(job(&server)).await.unwrap();
        assert!(deployed(&h).await);

        let deployment = h.cluster.deployment("ns-0xabc", "deploy-uuid-1").unwrap();
        assert!(deployment.accelerator_product.is_some());
        assert_eq!(deployment.resources.accelerators, 1);
        assert_eq!(h.pipeline.store().space("uuid-1").unwrap().unwrap().task_type, "GPU");
    }

    #[tokio::test]
    async fn test_no_capacity_rejects_before_anything_runs() {
        let h = harness();
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], "CPU only · 64 vCPU · 8 GiB").await;

        let err = h.pipeline.receive(job(&server)).await.unwrap_err();
        assert!(matches!(err, ProviderError::ResourceUnavailable(_)));
        assert!(h.pipeline.units().is_empty());
        assert!(h.pipeline.store().space("uuid-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signature_checked_when_enabled() {
        let h = harness_with(true, InMemoryImageBuilder::new());
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], CPU_SPACE).await;

        let unsigned = job(&server);
        assert!(matches!(
            h.pipeline.receive(unsigned.clone()).await,
            Err(ProviderError::Validation(_))
        ));

        let stranger = SigningKey::from_slice(&[4u8; 32]).unwrap();
        let message = format!("{NODE_ID}{}", unsigned.job_source_uri);
        let forged = SpaceJob {
            node_id_job_source_uri_signature: sign(&stranger, message.as_bytes(), Framing::PersonalSign).unwrap(),
            ..unsigned.clone()
        };
        assert!(matches!(
            h.pipeline.receive(forged).await,
            Err(ProviderError::Authorization(_))
        ));

        let signed = SpaceJob {
            node_id_job_source_uri_signature: sign(&h.hub, message.as_bytes(), Framing::PersonalSign).unwrap(),
            ..unsigned
        };
        h.pipeline.receive(signed).await.unwrap();
        assert!(deployed(&h).await);
    }

    #[tokio::test]
    async fn test_failed_build_rolls_back() {
        let mut h = harness_with(false, InMemoryImageBuilder::failing());
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], CPU_SPACE).await;

        h.pipeline.receive(job(&server)).await.unwrap();
        assert!(!deployed(&h).await);

        assert!(h.cluster.deployment("ns-0xabc", "deploy-uuid-1").is_none());
        assert_eq!(h.cluster.pod_count("ns-0xabc"), 0);
        let stages: Vec<_> = h.reporter.drain().into_iter().map(|e| e.stage).collect();
        assert_eq!(stages.last(), Some(&DeployStage::Failed));
    }

    #[tokio::test]
    async fn test_redeploy_keeps_known_host() {
        let h = harness();
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], CPU_SPACE).await;
        Mock::given(method("GET"))
            .and(path("/result/uuid-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "job_result_uri": "https://keep.example.org" })),
            )
            .mount(&server)
            .await;

        let mut request = job(&server);
        request.job_result_uri = format!("{}/result/uuid-1", server.uri());
        let response = h.pipeline.redeploy(request).await.unwrap();
        assert_eq!(response.job_result_uri, "https://keep.example.org");
        assert!(deployed(&h).await);
        assert_eq!(
            h.cluster.ingress("ns-0xabc", "ing-uuid-1").unwrap().host,
            "keep.example.org"
        );
    }

    fn lease(h: &Harness, space_uuid: &str, task_uuid: &str, expire_time: i64) {
        h.pipeline
            .store()
            .save_space(&SpaceDeployment {
                wallet_address: "0xabc".into(),
                space_name: space_uuid.into(),
                expire_time,
                space_uuid: space_uuid.into(),
                task_uuid: task_uuid.into(),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_renew_outcomes() {
        let h = harness();
        let now = 1_700_000_000;
        lease(&h, "live", "t-live", now + 100);
        lease(&h, "gone", "t-gone", now - 1);

        assert_eq!(
            h.pipeline.renew("T-LIVE", 3600, now).unwrap(),
            RenewOutcome::Extended {
                expire_time: now + 100 + 3600
            }
        );
        assert_eq!(h.pipeline.store().space("live").unwrap().unwrap().expire_time, now + 3700);

        assert_eq!(h.pipeline.renew("t-gone", 3600, now).unwrap(), RenewOutcome::Expired);
        assert_eq!(h.pipeline.store().space("gone").unwrap().unwrap().expire_time, now - 1);

        assert!(matches!(h.pipeline.renew("t-none", 10, now), Err(ProviderError::NotFound(_))));
        assert!(matches!(h.pipeline.renew("t-live", 0, now), Err(ProviderError::Validation(_))));
        assert!(matches!(h.pipeline.renew("", 10, now), Err(ProviderError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancel_rolls_back_and_keeps_record() {
        let h = harness();
        let server = space_server(&[("Dockerfile", "FROM scratch\n")], CPU_SPACE).await;
        h.pipeline.receive(job(&server)).await.unwrap();
        assert!(deployed(&h).await);

        assert!(!h.pipeline.cancel("unknown").unwrap());
        assert!(h.pipeline.cancel("task-1").unwrap());
        assert!(h.pipeline.units().join("rollback-uuid-1").await.unwrap().unwrap());

        assert!(h.cluster.deployment("ns-0xabc", "deploy-uuid-1").is_none());
        assert!(h.cluster.ingress("ns-0xabc", "ing-uuid-1").is_none());
        assert!(h.builder.images().is_empty());
        assert!(h.pipeline.store().space("uuid-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expire_due_removes_only_expired() {
        let h = harness();
        let now = 1_700_000_000;
        lease(&h, "live", "t-live", now + 100);
        lease(&h, "gone", "t-gone", now - 1);

        let expired = h.pipeline.expire_due(now).await.unwrap();
        assert_eq!(expired, vec!["gone".to_string()]);
        assert!(h.pipeline.store().space("gone").unwrap().is_none());
        assert!(h.pipeline.store().space("live").unwrap().is_some());
    }
}
