//! Application state shared across request handlers.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::dispatcher::UbiDispatcher;
use crate::pipeline::SpacePipeline;
use crate::proof::ProofJobRunner;

/// Identity of this provider as reported by `/cp/info`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub multi_address: String,
    /// Whether this provider accepts proof tasks.
    pub ubi_task: bool,
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    info: NodeInfo,
    cluster: Arc<dyn Cluster>,
    dispatcher: UbiDispatcher,
    pipeline: SpacePipeline,
    proofs: ProofJobRunner,
}

impl AppState {
    pub fn new(
        info: NodeInfo,
        cluster: Arc<dyn Cluster>,
        dispatcher: UbiDispatcher,
        pipeline: SpacePipeline,
        proofs: ProofJobRunner,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                info,
                cluster,
                dispatcher,
                pipeline,
                proofs,
            }),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.inner.info
    }

    pub fn cluster(&self) -> &dyn Cluster {
        self.inner.cluster.as_ref()
    }

    pub fn dispatcher(&self) -> &UbiDispatcher {
        &self.inner.dispatcher
    }

    pub fn pipeline(&self) -> &SpacePipeline {
        &self.inner.pipeline
    }

    pub fn proofs(&self) -> &ProofJobRunner {
        &self.inner.proofs
    }
}
