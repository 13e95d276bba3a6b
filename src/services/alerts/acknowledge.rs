use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;

use crate::services::auth::TokenSource;
use crate::services::metrics::PollMetricsCollector;
use crate::services::polling::PollingError;

/// One-shot acknowledge RPC, independent of any polling loop
pub struct AcknowledgeClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    metrics: Option<PollMetricsCollector>,
}

impl AcknowledgeClient {
    pub fn new(client: Client, base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PollMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn url_for(&self, timer_id: i64, threshold_minutes: u32) -> Result<Url, PollingError> {
        let raw = format!("{}/timers/{}/alerts/acknowledge", self.base_url, timer_id);
        Url::parse_with_params(&raw, &[("alert_minutes", threshold_minutes.to_string())]).map_err(
            |e| PollingError::Transport { status: None, message: format!("invalid URL {}: {}", raw, e) },
        )
    }

    /// `POST /timers/{timer_id}/alerts/acknowledge?alert_minutes={n}` with no body.
    /// Any 2xx is success.
    pub async fn acknowledge(&self, timer_id: i64, threshold_minutes: u32) -> Result<(), PollingError> {
        let result = self.send(timer_id, threshold_minutes).await;

        match &result {
            Ok(()) => tracing::debug!(timer_id, threshold_minutes, "Alert acknowledged"),
            Err(e) => tracing::warn!(timer_id, threshold_minutes, "Alert acknowledge failed: {}", e),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_acknowledgement(result.is_ok());
        }

        result
    }

    async fn send(&self, timer_id: i64, threshold_minutes: u32) -> Result<(), PollingError> {
        let token = self.tokens.token().ok_or_else(|| {
            PollingError::Authentication("no authentication token available".to_string())
        })?;
        let url = self.url_for(timer_id, threshold_minutes)?;

        let response = self.client.post(url).bearer_auth(token).send().await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(PollingError::Authentication(
                "server rejected credentials".to_string(),
            )),
            s => Err(PollingError::Transport {
                status: Some(s.as_u16()),
                message: s.canonical_reason().unwrap_or("unexpected status").to_string(),
            }),
        }
    }
}
