//! Deployment status reporting.
//!
//! Pipeline call sites push [`StatusEvent`]s into a bounded queue; a single
//! [`StatusReporter`] drains it and forwards each event to the hub. Producers
//! never wait: when the queue is full the event is dropped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

/// Queue capacity between the pipeline and the reporter.
pub const STATUS_QUEUE_CAPACITY: usize = 256;

/// Stage of a space deployment as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    UploadResult,
    DownloadSource,
    ModelInference,
    YamlDeploy,
    DockerfileDeploy,
    Deployed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Job uuid.
    pub id: String,
    pub stage: DeployStage,
    #[serde(default)]
    pub url: String,
}

impl StatusEvent {
    pub fn new(id: impl Into<String>, stage: DeployStage) -> Self {
        Self {
            id: id.into(),
            stage,
            url: String::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// Producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusSender {
    pub fn report(&self, event: StatusEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(job_uuid = %event.id, stage = ?event.stage, "Status queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(job_uuid = %event.id, stage = ?event.stage, "Status reporter stopped, dropping event");
            }
        }
    }
}

/// Single consumer of the status queue.
pub struct StatusReporter {
    rx: mpsc::Receiver<StatusEvent>,
    client: reqwest::Client,
    hub_url: Option<String>,
}

impl StatusReporter {
    /// Create the queue. With no hub URL events are only logged.
    pub fn channel(hub_url: Option<String>, capacity: usize) -> (StatusSender, StatusReporter) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        (StatusSender { tx }, StatusReporter { rx, client, hub_url })
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(hub_url = ?self.hub_url, "Starting status reporter");

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.forward(&event).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Status reporter shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Events queued so far, without forwarding them.
    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<StatusEvent> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    async fn forward(&self, event: &StatusEvent) {
        let Some(url) = &self.hub_url else {
            info!(job_uuid = %event.id, stage = ?event.stage, url = %event.url, "Deployment status");
            return;
        };

        match self.client.post(url).json(event).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(job_uuid = %event.id, stage = ?event.stage, "Status reported");
            }
            Ok(response) => {
                warn!(job_uuid = %event.id, status = %response.status(), "Hub rejected status update");
            }
            Err(e) => {
                warn!(job_uuid = %event.id, error = %e, "Failed to report status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_stage_wire_names() {
        let event = StatusEvent::new("job-1", DeployStage::DownloadSource);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "download_source");
        assert_eq!(json["url"], "");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sender, mut reporter) = StatusReporter::channel(None, 1);
        sender.report(StatusEvent::new("a", DeployStage::UploadResult));
        sender.report(StatusEvent::new("b", DeployStage::UploadResult));

        assert_eq!(reporter.rx.recv().await.unwrap().id, "a");
        assert!(reporter.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_forwarded_to_hub() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/status"))
            .and(body_json(serde_json::json!({
                "id": "job-1", "stage": "deployed", "url": "https://abc.example.org"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (sender, reporter) = StatusReporter::channel(Some(format!("{}/status", server.uri())), 8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reporter.run(shutdown_rx));

        sender.report(StatusEvent::new("job-1", DeployStage::Deployed).with_url("https://abc.example.org"));
        drop(sender);
        handle.await.unwrap();
        drop(shutdown_tx);
        server.verify().await;
    }
}
