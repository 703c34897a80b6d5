//! Best-effort teardown of a space's cluster objects.

use std::time::Duration;

use tracing::{info, warn};

use super::names;
use crate::cluster::{ignore_not_found, Cluster, ClusterError, ImageBuilder};

#[derive(Debug, Clone)]
pub struct RollbackConfig {
    /// Pause between pod-drain checks.
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_polls: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    /// Whether the space's pods were gone before the poll ceiling.
    pub drained: bool,
    /// Delete calls that failed and were skipped.
    pub failures: usize,
}

/// Remove ingress, service, images, deployment, replica sets and pods of a
/// space, in that order, then wait a bounded time for the pods to go.
///
/// Failures are logged and skipped. The drain ceiling never blocks the caller
/// beyond `poll_interval * max_polls`.
pub async fn rollback(
    cluster: &dyn Cluster,
    builder: &dyn ImageBuilder,
    namespace: &str,
    space_uuid: &str,
    config: &RollbackConfig,
) -> RollbackReport {
    info!(namespace = %namespace, space_uuid = %space_uuid, "Rolling back space");
    let mut failures = 0;
    let mut check = |step: &str, result: Result<(), ClusterError>| {
        if let Err(e) = ignore_not_found(result) {
            warn!(space_uuid = %space_uuid, step = step, error = %e, "Rollback step failed");
            failures += 1;
        }
    };

    let deployment = names::deployment(space_uuid);
    check(
        "ingress",
        cluster.delete_ingress(namespace, &names::ingress(space_uuid)).await,
    );
    check(
        "service",
        cluster.delete_service(namespace, &names::service(space_uuid)).await,
    );

    let images = match cluster.deployment_images(namespace, &deployment).await {
        Ok(images) => images,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => {
            check("images", Err(e));
            Vec::new()
        }
    };
    for image in &images {
        if let Err(e) = builder.remove(image).await {
            warn!(image = %image, error = %e, "Failed to remove space image");
        }
    }

    check("deployment", cluster.delete_deployment(namespace, &deployment).await);
    check("replica_sets", cluster.delete_replica_sets(namespace, space_uuid).await);
    check("pods", cluster.delete_pods(namespace, space_uuid).await);

    let mut drained = false;
    for _ in 0..config.max_polls {
        match cluster.has_pods(namespace, space_uuid).await {
            Ok(false) => {
                drained = true;
                break;
            }
            Ok(true) => {}
            Err(e) if e.is_not_found() => {
                drained = true;
                break;
            }
            Err(e) => warn!(space_uuid = %space_uuid, error = %e, "Failed to list space pods"),
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    if drained {
        info!(space_uuid = %space_uuid, "Space rolled back");
    } else {
        warn!(space_uuid = %space_uuid, polls = config.max_polls, "Space pods still present after rollback");
    }
    RollbackReport { drained, failures }
}
