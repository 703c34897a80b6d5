//! Provider error taxonomy.

use cp_authz::AuthzError;
use cp_placement::PlacementError;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::store::StoreError;

/// Errors raised by task intake, the dispatcher and the deployment pipeline.
///
/// Validation and authorization errors surface synchronously. Everything else
/// raised inside a detached unit ends up as a terminal task status and a log
/// line.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthzError),

    #[error("resources unavailable: {0}")]
    ResourceUnavailable(#[from] PlacementError),

    #[error("placement failed: {0}")]
    Placement(String),

    #[error("proof submission failed: {0}")]
    Submission(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator serving space sources or proof jobs misbehaved.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl ProviderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn placement(msg: impl Into<String>) -> Self {
        Self::Placement(msg.into())
    }

    pub fn submission(msg: impl std::fmt::Display) -> Self {
        Self::Submission(msg.to_string())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(msg: impl std::fmt::Display) -> Self {
        Self::Upstream(msg.to_string())
    }
}
