//! Proof workload construction.

use cp_envfile::EnvFile;
use cp_placement::{Architecture, Placement, ResourceEnvelope, ResourceRequest};

use crate::cluster::{HostPathMount, JobSpec};
use crate::model::TaskKind;

/// Mount point of the proof parameter cache inside the worker.
pub const PARAMETER_MOUNT_PATH: &str = "/var/tmp/filecoin-proof-parameters";

const PARAMETER_VOLUME: &str = "proof-params";
const BACKOFF_LIMIT: i32 = 1;
const TTL_SECONDS_AFTER_FINISHED: i32 = 120;

/// Worker image for a task kind on a given architecture.
pub fn worker_image(kind: TaskKind, architecture: Architecture) -> &'static str {
    match (kind, architecture) {
        (TaskKind::Cpu, Architecture::Intel) => "filswan/ubi-worker-cpu-intel:v2.0",
        (TaskKind::Gpu, Architecture::Intel) => "filswan/ubi-worker-gpu-intel:v2.0",
        (TaskKind::Cpu, Architecture::Amd) => "filswan/ubi-worker-cpu-amd:v2.0",
        (TaskKind::Gpu, Architecture::Amd) => "filswan/ubi-worker-gpu-amd:v2.0",
    }
}

/// Isolated namespace of a proof task.
pub fn task_namespace(task_id: &str) -> String {
    format!("ubi-task-{task_id}")
}

pub fn job_name(zk_type: &str, task_id: &str) -> String {
    format!("{}-{}", zk_type.to_lowercase(), task_id)
}

/// Everything the detached unit needs to launch one proof task.
#[derive(Debug, Clone)]
pub struct ProofTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub zk_type: String,
    pub input_param: String,
    pub request: ResourceRequest,
}

/// Build the job for `task` on the chosen node.
pub fn build_job(
    task: &ProofTask,
    placement: &Placement,
    architecture: Architecture,
    env_file: &EnvFile,
    parameter_cache: &str,
    callback_url: &str,
) -> JobSpec {
    let namespace = task_namespace(&task.task_id);

    let mut env = env_file.workload_env(task.kind.is_accelerated());
    env.extend([
        ("RECEIVE_PROOF_URL".to_string(), callback_url.to_string()),
        ("TASKID".to_string(), task.task_id.clone()),
        ("TASK_TYPE".to_string(), task.kind.type_code().to_string()),
        ("ZK_TYPE".to_string(), task.zk_type.clone()),
        ("NAME_SPACE".to_string(), namespace.clone()),
        ("PARAM_URL".to_string(), task.input_param.clone()),
    ]);

    JobSpec {
        name: job_name(&task.zk_type, &task.task_id),
        namespace,
        node_name: Some(placement.node.clone()),
        image: worker_image(task.kind, architecture).to_string(),
        command: vec!["ubi-bench".to_string(), "c2".to_string()],
        env,
        resources: Some(ResourceEnvelope::from_request(&task.request)),
        accelerator_product: placement.accelerator_product.clone(),
        mounts: vec![HostPathMount {
            name: PARAMETER_VOLUME.to_string(),
            host_path: parameter_cache.to_string(),
            mount_path: PARAMETER_MOUNT_PATH.to_string(),
        }],
        backoff_limit: BACKOFF_LIMIT,
        ttl_seconds_after_finished: TTL_SECONDS_AFTER_FINISHED,
    }
}
