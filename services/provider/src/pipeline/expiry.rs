use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::SpacePipeline;

#[derive(Debug, Clone)]
pub struct ExpiryWorkerConfig {
    pub interval: Duration,
}

impl Default for ExpiryWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Periodically tears down spaces whose lease has run out.
pub struct ExpiryWorker {
    pipeline: SpacePipeline,
    config: ExpiryWorkerConfig,
}

impl ExpiryWorker {
    pub fn new(pipeline: SpacePipeline, config: ExpiryWorkerConfig) -> Self {
        Self { pipeline, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "Starting space expiry worker");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Space expiry worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.pipeline.expire_due(Utc::now().timestamp()).await {
            Ok(expired) if !expired.is_empty() => {
                info!(expired = expired.len(), spaces = ?expired, "Expired spaces removed");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to sweep expired spaces"),
        }
    }
}
