//! On-demand proof-of-work jobs.
//!
//! A proof request becomes a one-shot job in the default namespace. The
//! caller waits, bounded, for it to succeed and gets the worker's log output.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ensure_namespace, Cluster, ClusterError, JobSpec};
use crate::error::ProviderError;
use crate::pipeline::names::random_suffix;

pub const PROOF_IMAGE: &str = "filswan/worker-proof:v1.0";
pub const PROOF_NAMESPACE: &str = "default";

const MAX_EXP: i64 = 250;

/// `POST /cp/proof` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProofRequest {
    pub method: String,
    pub block_data: String,
    pub exp: i64,
}

impl ProofRequest {
    pub fn validate(&self) -> Result<(), ProviderError> {
        let method = self.method.trim();
        if method.is_empty() {
            return Err(ProviderError::validation("missing required field: method"));
        }
        if method != "mine" {
            return Err(ProviderError::validation("method must be mine"));
        }
        if !(0..=MAX_EXP).contains(&self.exp) {
            return Err(ProviderError::validation("exp range is [0~250]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProofJobConfig {
    pub poll_interval: Duration,
    /// Ceiling on the wait for the job to succeed.
    pub timeout: Duration,
}

impl Default for ProofJobConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(300),
        }
    }
}

fn proof_job(request: &ProofRequest) -> JobSpec {
    JobSpec {
        name: format!("proof-job-{}", random_suffix(5)),
        namespace: PROOF_NAMESPACE.to_string(),
        node_name: None,
        image: PROOF_IMAGE.to_string(),
        command: Vec::new(),
        env: vec![
            ("METHOD".to_string(), request.method.trim().to_string()),
            ("BLOCK_DATA".to_string(), request.block_data.clone()),
            ("EXP".to_string(), request.exp.to_string()),
        ],
        resources: None,
        accelerator_product: None,
        mounts: Vec::new(),
        backoff_limit: 1,
        ttl_seconds_after_finished: 30,
    }
}

#[derive(Clone)]
pub struct ProofJobRunner {
    cluster: Arc<dyn Cluster>,
    config: ProofJobConfig,
}

impl ProofJobRunner {
    pub fn new(cluster: Arc<dyn Cluster>, config: ProofJobConfig) -> Self {
        Self { cluster, config }
    }

    /// Run a proof job and return its log output.
    #[instrument(skip(self, request), fields(method = %request.method, exp = request.exp))]
    pub async fn run(&self, request: &ProofRequest) -> Result<String, ProviderError> {
        request.validate()?;

        let job = proof_job(request);
        ensure_namespace(self.cluster.as_ref(), &job.namespace).await?;
        self.cluster.create_job(&job).await?;
        info!(job = %job.name, "Proof job created");

        let deadline = Instant::now() + self.config.timeout;
        loop {
            let status = self.cluster.job_status(&job.namespace, &job.name).await?;
            if status.succeeded > 0 {
                break;
            }
            if status.active == 0 && status.failed > 0 {
                warn!(job = %job.name, failed = status.failed, "Proof job failed");
                return Err(ClusterError::Request(format!("proof job {} failed", job.name)).into());
            }
            if Instant::now() >= deadline {
                warn!(job = %job.name, timeout_secs = self.config.timeout.as_secs(), "Proof job timed out");
                return Err(ClusterError::Request(format!(
                    "proof job {} did not finish within {:?}",
                    job.name, self.config.timeout
                ))
                .into());
            }
            debug!(job = %job.name, active = status.active, "Waiting for proof job");
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let logs = self.cluster.job_logs(&job.namespace, &job.name).await?;
        info!(job = %job.name, bytes = logs.len(), "Proof job finished");
        Ok(logs)
    }
}
