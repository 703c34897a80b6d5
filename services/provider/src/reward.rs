//! Reward service client.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

use crate::model::NO_REWARD;

#[derive(Debug, Deserialize)]
struct RewardResponse {
    data: RewardData,
}

#[derive(Debug, Deserialize)]
struct RewardData {
    #[serde(default)]
    list: Vec<RewardEntry>,
}

#[derive(Debug, Deserialize)]
struct RewardEntry {
    amount: serde_json::Value,
}

/// Read-only client for `GET {base}/rewards?node_id&task_id`.
#[derive(Clone)]
pub struct RewardClient {
    client: reqwest::Client,
    base_url: String,
}

impl RewardClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Reward for a task formatted with two decimals, or `"0.0"` when the
    /// service has nothing yet.
    pub async fn reward(&self, node_id: &str, task_id: &str) -> Result<String> {
        let url = format!("{}/rewards", self.base_url);
        debug!(task_id = %task_id, "Fetching task reward");

        let response = self
            .client
            .get(&url)
            .query(&[("node_id", node_id), ("task_id", task_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            error!(status = %status, task_id = %task_id, "Failed to fetch reward");
            anyhow::bail!("Failed to fetch reward: {}", status);
        }

        let body: RewardResponse = response.json().await?;
        let Some(entry) = body.data.list.first() else {
            return Ok(NO_REWARD.to_string());
        };
        let amount = match &entry.amount {
            serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        Ok(format!("{amount:.2}"))
    }
}

/// Whether a formatted reward carries a nonzero amount.
pub fn is_nonzero(reward: &str) -> bool {
    reward.trim().parse::<f64>().map(|v| v != 0.0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reward_formatted_to_two_decimals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rewards"))
            .and(query_param("node_id", "n1"))
            .and(query_param("task_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "list": [{ "amount": "1.23456" }] }
            })))
            .mount(&server)
            .await;

        let client = RewardClient::new(server.uri()).unwrap();
        assert_eq!(client.reward("n1", "42").await.unwrap(), "1.23");
    }

    #[tokio::test]
    async fn test_empty_list_is_no_reward() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rewards"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": { "list": [] } })))
            .mount(&server)
            .await;

        let client = RewardClient::new(server.uri()).unwrap();
        assert_eq!(client.reward("n1", "1").await.unwrap(), NO_REWARD);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = RewardClient::new(server.uri()).unwrap();
        assert!(client.reward("n1", "1").await.is_err());
    }

    #[test]
    fn test_is_nonzero() {
        assert!(is_nonzero("1.50"));
        assert!(!is_nonzero("0.0"));
        assert!(!is_nonzero("0.00"));
        assert!(!is_nonzero("abc"));
    }
}
