//! Proof task dispatch.
//!
//! Intake validates and authorizes a task, persists it as `received` and
//! hands the cluster work to a detached unit. The unit places the task, opens
//! its namespace and submits the worker job. The worker reports back through
//! [`UbiDispatcher::receive_proof`], whose finalizer always settles the record
//! and releases the namespace.

pub mod job;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use cp_authz::{ensure_signed_by, Framing};
use cp_envfile::EnvFile;
use cp_placement::{parse_cpu, parse_quantity, place, PlacementStrategy, ResourceRequest};
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{ChainClient, Keystore, ProofSubmission};
use crate::cluster::{ensure_namespace, ignore_not_found, Cluster};
use crate::error::ProviderError;
use crate::model::{TaskKind, TaskRecord, TaskStatus, NO_REWARD};
use crate::reward::{is_nonzero, RewardClient};
use crate::store::{StoreError, TaskStore};
use crate::units::{CancelSignal, DetachedUnits};

pub use job::{build_job, job_name, task_namespace, worker_image, ProofTask};

/// Resources requested by a proof task, as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskResource {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub storage: String,
}

/// `POST /cp/ubi` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UbiTaskRequest {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: i64,
    pub zk_type: String,
    pub input_param: String,
    pub resource: Option<TaskResource>,
    pub signature: String,
}

/// Worker result callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct ProofCallback {
    pub task_id: String,
    pub task_type: String,
    pub proof: String,
    pub zk_type: String,
    #[serde(default)]
    pub name_space: String,
}

/// Fields recovered from a callback body even when it does not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CallbackHint {
    task_id: String,
    task_type: String,
    zk_type: String,
    name_space: String,
}

impl CallbackHint {
    fn sniff(body: &[u8]) -> Self {
        let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) else {
            return Self::default();
        };
        let text = |name: &str| match map.get(name) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Self {
            task_id: text("task_id"),
            task_type: text("task_type"),
            zk_type: text("zk_type"),
            name_space: text("name_space"),
        }
    }

    /// Namespace to release: the reported one, else the task's own.
    fn namespace(&self) -> Option<String> {
        if !self.name_space.is_empty() {
            Some(self.name_space.clone())
        } else if !self.task_id.is_empty() {
            Some(task_namespace(&self.task_id))
        } else {
            None
        }
    }
}

/// Static settings of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub node_id: String,
    /// Address whose signature authorizes proof tasks.
    pub engine_address: String,
    /// URL workers post their proof to.
    pub callback_url: String,
    /// Directory holding `fil-c2.env`.
    pub repo_path: PathBuf,
}

#[derive(Clone)]
pub struct UbiDispatcher {
    settings: Arc<DispatcherSettings>,
    store: TaskStore,
    cluster: Arc<dyn Cluster>,
    chain: Arc<dyn ChainClient>,
    keystore: Arc<dyn Keystore>,
    strategy: Arc<dyn PlacementStrategy>,
    rewards: Option<RewardClient>,
    units: DetachedUnits<TaskStatus>,
}

impl UbiDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        store: TaskStore,
        cluster: Arc<dyn Cluster>,
        chain: Arc<dyn ChainClient>,
        keystore: Arc<dyn Keystore>,
        strategy: Arc<dyn PlacementStrategy>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            cluster,
            chain,
            keystore,
            strategy,
            rewards: None,
            units: DetachedUnits::new(),
        }
    }

    pub fn with_rewards(mut self, rewards: RewardClient) -> Self {
        self.rewards = Some(rewards);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn units(&self) -> &DetachedUnits<TaskStatus> {
        &self.units
    }

    /// Accept a proof task.
    ///
    /// Rejections happen before anything is persisted. On success the record
    /// is `received` and placement runs in a detached unit.
    #[instrument(skip(self, request), fields(task_id = request.id))]
    pub async fn submit(&self, request: UbiTaskRequest) -> Result<TaskRecord, ProviderError> {
        let task = validate(&request)?;

        let message = format!("{}{}", self.settings.node_id, task.task_id);
        ensure_signed_by(
            &self.settings.engine_address,
            message.as_bytes(),
            &request.signature,
            Framing::Raw,
        )
        .inspect_err(|e| warn!(task_id = %task.task_id, error = %e, "Proof task signature rejected"))?;

        // The unit slot is claimed before the record is written, so two
        // intakes of the same id cannot both reset it to received.
        let record = TaskRecord::received(&task.task_id, task.kind, &task.zk_type, Utc::now());
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let this = self.clone();
        let unit_record = record.clone();
        let task_id = task.task_id.clone();
        let claimed = self.units.spawn(task_id.clone(), move |cancel| async move {
            if start_rx.await.is_err() {
                debug!(task_id = %unit_record.task_id, "Intake aborted before dispatch");
                return unit_record.status;
            }
            this.run(task, unit_record, cancel).await
        });
        if !claimed {
            return Err(ProviderError::validation(format!(
                "task {task_id} is already being dispatched"
            )));
        }

        // Dropping the sender on error releases the claimed unit.
        self.store.save_task(&record)?;
        info!(task_id = %record.task_id, kind = %record.task_type, zk_type = %record.zk_type, "Proof task received");
        let _ = start_tx.send(());
        Ok(record)
    }

    /// Detached part of intake. Returns the status the unit left behind.
    async fn run(self, task: ProofTask, record: TaskRecord, mut cancel: CancelSignal) -> TaskStatus {
        let namespace = task_namespace(&task.task_id);
        let launched = tokio::select! {
            result = self.launch(&task) => result,
            _ = cancel.cancelled() => Err(ProviderError::placement("dispatch cancelled")),
        };

        match launched {
            Ok(()) => {
                match self.advance(&record, TaskStatus::Running) {
                    Ok(true) => {
                        info!(task_id = %task.task_id, namespace = %namespace, "Proof task running");
                        TaskStatus::Running
                    }
                    Ok(false) => {
                        debug!(task_id = %task.task_id, "Record changed before the running transition");
                        self.current_status(&task.task_id).unwrap_or(TaskStatus::Running)
                    }
                    Err(e) => {
                        error!(task_id = %task.task_id, error = %e, "Failed to persist running status");
                        TaskStatus::Running
                    }
                }
            }
            Err(e) => {
                match &e {
                    ProviderError::ResourceUnavailable(p) => {
                        warn!(task_id = %task.task_id, reason = ?p.reason(), "No node available for proof task");
                    }
                    other => error!(task_id = %task.task_id, error = %other, "Proof task dispatch failed"),
                }
                if !matches!(e, ProviderError::ResourceUnavailable(_)) {
                    if let Err(e) = ignore_not_found(self.cluster.delete_namespace(&namespace).await) {
                        warn!(namespace = %namespace, error = %e, "Failed to delete task namespace");
                    }
                }
                self.mark_failed(&record);
                TaskStatus::Failed
            }
        }
    }

    async fn launch(&self, task: &ProofTask) -> Result<(), ProviderError> {
        let env_file = EnvFile::read_from_repo(&self.settings.repo_path)
            .map_err(|e| ProviderError::placement(format!("reading proof environment: {e}")))?;
        let parameter_cache = env_file
            .parameter_cache()
            .ok_or_else(|| ProviderError::placement("proof parameter cache path is not configured"))?
            .to_string();

        let mut request = task.request.clone();
        if task.kind.is_accelerated() {
            request = request.with_accelerator(env_file.accelerator_descriptor(), 1);
        }

        let nodes = self.cluster.list_nodes().await?;
        let workloads = self.cluster.list_workloads().await?;
        let placement = place(self.strategy.as_ref(), &request, &nodes, &workloads)?;
        let architecture = placement
            .architecture
            .ok_or_else(|| ProviderError::placement(format!("node {} has no architecture label", placement.node)))?;
        debug!(task_id = %task.task_id, node = %placement.node, architecture = %architecture, "Proof task placed");

        let placed = ProofTask { request, ..task.clone() };
        let job = build_job(
            &placed,
            &placement,
            architecture,
            &env_file,
            &parameter_cache,
            &self.settings.callback_url,
        );

        ensure_namespace(self.cluster.as_ref(), &job.namespace).await?;
        self.cluster.create_job(&job).await?;
        info!(task_id = %task.task_id, job = %job.name, node = %placement.node, image = %job.image, "Proof job submitted");
        Ok(())
    }

    fn current_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.store.task(task_id).ok().flatten().map(|r| r.status)
    }

    fn mark_failed(&self, record: &TaskRecord) {
        let current = match self.store.task(&record.task_id) {
            Ok(Some(current)) => current,
            Ok(None) => record.clone(),
            Err(e) => {
                error!(task_id = %record.task_id, error = %e, "Failed to read task record");
                record.clone()
            }
        };
        if !current.status.can_transition_to(TaskStatus::Failed) {
            return;
        }
        let mut failed = current;
        failed.status = TaskStatus::Failed;
        if let Err(e) = self.store.save_task(&failed) {
            error!(task_id = %record.task_id, error = %e, "Failed to persist failed status");
        }
    }

    /// Compare-and-swap `current` to `next`. `Ok(false)` when the record
    /// moved underneath us or the transition would go backwards.
    fn advance(&self, current: &TaskRecord, next: TaskStatus) -> Result<bool, StoreError> {
        if !current.status.can_transition_to(next) {
            debug!(task_id = %current.task_id, from = %current.status, to = %next, "Refusing backward transition");
            return Ok(false);
        }
        let mut updated = current.clone();
        updated.status = next;
        self.store.replace_task(current, &updated)
    }

    /// Handle a worker's result callback.
    ///
    /// Whatever happens while parsing the body or submitting the proof, the
    /// record ends up `success` or `failed` and the task namespace is deleted.
    #[instrument(skip(self, body))]
    pub async fn receive_proof(&self, body: &[u8]) -> Result<String, ProviderError> {
        let hint = CallbackHint::sniff(body);

        let result = match AssertUnwindSafe(self.submit_proof(body)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ProviderError::submission(format!(
                "proof submission panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let (status, tx) = match &result {
            Ok(tx) => (TaskStatus::Success, tx.clone()),
            Err(e) => {
                error!(task_id = %hint.task_id, error = %e, "Proof submission failed");
                (TaskStatus::Failed, String::new())
            }
        };
        self.finalize(&hint, status, tx).await;
        result
    }

    async fn submit_proof(&self, body: &[u8]) -> Result<String, ProviderError> {
        let callback: ProofCallback = serde_json::from_slice(body)
            .map_err(|e| ProviderError::validation(format!("invalid proof callback: {e}")))?;
        info!(task_id = %callback.task_id, zk_type = %callback.zk_type, "Proof received");

        let task_type: u8 = callback
            .task_type
            .trim()
            .parse()
            .map_err(|_| ProviderError::validation(format!("invalid task_type '{}'", callback.task_type)))?;

        let owner = self
            .chain
            .owner_address(&self.settings.node_id)
            .await
            .map_err(ProviderError::submission)?;
        let key = self
            .keystore
            .find_key(&owner)
            .await
            .map_err(ProviderError::submission)?;

        let submission = ProofSubmission {
            task_id: callback.task_id,
            task_type,
            zk_type: callback.zk_type,
            proof: callback.proof,
        };
        self.chain
            .submit_ubi_proof(&key, &submission)
            .await
            .map_err(ProviderError::submission)
    }

    async fn finalize(&self, hint: &CallbackHint, status: TaskStatus, tx: String) {
        if hint.task_id.is_empty() {
            warn!("Proof callback without task id, no record to settle");
        } else {
            self.settle(hint, status, tx);
        }

        if let Some(namespace) = hint.namespace() {
            match ignore_not_found(self.cluster.delete_namespace(&namespace).await) {
                Ok(()) => debug!(namespace = %namespace, "Task namespace released"),
                Err(e) => warn!(namespace = %namespace, error = %e, "Failed to delete task namespace"),
            }
        }
    }

    fn settle(&self, hint: &CallbackHint, status: TaskStatus, tx: String) {
        let existing = match self.store.task(&hint.task_id) {
            Ok(existing) => existing,
            Err(e) => {
                error!(task_id = %hint.task_id, error = %e, "Failed to read task record");
                None
            }
        };

        let mut record = match existing {
            Some(record) if !record.status.can_transition_to(status) => {
                warn!(
                    task_id = %hint.task_id,
                    current = %record.status,
                    reported = %status,
                    "Task already settled, ignoring duplicate result"
                );
                return;
            }
            Some(record) => record,
            None => {
                let kind = TaskKind::parse(&hint.task_type).unwrap_or(TaskKind::Cpu);
                TaskRecord::received(&hint.task_id, kind, &hint.zk_type, Utc::now())
            }
        };

        record.status = status;
        record.tx = tx;
        match self.store.save_task(&record) {
            Ok(()) => info!(task_id = %record.task_id, status = %record.status, tx = %record.tx, "Proof task settled"),
            Err(e) => error!(task_id = %record.task_id, error = %e, "Failed to persist final status"),
        }
    }

    /// Task records, newest first. Failed ones only when asked.
    ///
    /// Records still showing no reward are looked up on the reward service;
    /// a nonzero amount is written back with the status left untouched.
    pub async fn list_tasks(&self, show_failed: bool) -> Result<Vec<TaskRecord>, ProviderError> {
        let mut tasks: Vec<TaskRecord> = self
            .store
            .tasks()?
            .into_iter()
            .filter(|t| show_failed || t.status != TaskStatus::Failed)
            .collect();
        tasks.sort_by(|a, b| {
            b.create_time
                .cmp(&a.create_time)
                .then_with(|| numeric_id(&b.task_id).cmp(&numeric_id(&a.task_id)))
        });

        let Some(rewards) = &self.rewards else {
            return Ok(tasks);
        };
        for task in tasks.iter_mut().filter(|t| t.reward == NO_REWARD) {
            match rewards.reward(&self.settings.node_id, &task.task_id).await {
                Ok(amount) if is_nonzero(&amount) => {
                    let mut updated = task.clone();
                    updated.reward = amount;
                    match self.store.replace_task(task, &updated) {
                        Ok(true) => *task = updated,
                        Ok(false) => debug!(task_id = %task.task_id, "Record changed during reward backfill"),
                        Err(e) => warn!(task_id = %task.task_id, error = %e, "Failed to backfill reward"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.task_id, error = %e, "Failed to fetch reward"),
            }
        }
        Ok(tasks)
    }
}

fn numeric_id(id: &str) -> u64 {
    id.parse().unwrap_or_default()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ProviderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProviderError::validation(format!("missing required field: {field}")));
    }
    Ok(value)
}

fn validate(request: &UbiTaskRequest) -> Result<ProofTask, ProviderError> {
    if request.id == 0 {
        return Err(ProviderError::validation("missing required field: id"));
    }
    required(&request.name, "name")?;
    let kind = TaskKind::from_type(request.task_type)
        .ok_or_else(|| ProviderError::validation("the value of type is 0 or 1"))?;
    let zk_type = required(&request.zk_type, "zk_type")?;
    let input_param = required(&request.input_param, "input_param")?;
    required(&request.signature, "signature")?;

    let resource = request
        .resource
        .as_ref()
        .ok_or_else(|| ProviderError::validation("missing required field: resource"))?;
    let invalid = |field: &str, e: cp_placement::QuantityError| ProviderError::validation(format!("invalid resource.{field}: {e}"));
    let cpu = parse_cpu(&resource.cpu).map_err(|e| invalid("cpu", e))?;
    let memory = parse_quantity(&resource.memory).map_err(|e| invalid("memory", e))?;
    let storage = parse_quantity(&resource.storage).map_err(|e| invalid("storage", e))?;

    Ok(ProofTask {
        task_id: request.id.to_string(),
        kind,
        zk_type: zk_type.to_string(),
        input_param: input_param.to_string(),
        request: ResourceRequest::new(cpu, memory, storage),
    })
}
