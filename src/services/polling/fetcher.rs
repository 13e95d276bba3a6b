use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::types::{FetchOutcome, PollSource, PollingError};
use crate::modules::timers::{AlertRecord, TimerSnapshot};
use crate::services::auth::TokenSource;

/// Shared HTTP client for all sync requests
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("timer-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// A pollable endpoint: its path and whether it honours `If-None-Match`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    pub conditional: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, path: impl Into<String>, conditional: bool) -> Self {
        Self { name: name.into(), path: path.into(), conditional }
    }

    /// `GET /timers/active?sucursal_id={id}`, conditional via ETag
    pub fn active_timers() -> Self {
        Self::new("timers", "/timers/active", true)
    }

    /// `GET /timers/alerts/pending?sucursal_id={id}`, always a full candidate set
    pub fn pending_alerts() -> Self {
        Self::new("alerts", "/timers/alerts/pending", false)
    }
}

/// One GET per poll, classified into unchanged / changed / failed.
pub struct ConditionalFetcher<T> {
    client: Client,
    base_url: String,
    endpoint: Endpoint,
    tokens: Arc<dyn TokenSource>,
    _payload: PhantomData<fn() -> T>,
}

pub type TimersFetcher = ConditionalFetcher<Vec<TimerSnapshot>>;
pub type AlertsFetcher = ConditionalFetcher<Vec<AlertRecord>>;

impl<T: DeserializeOwned> ConditionalFetcher<T> {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        endpoint: Endpoint,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint,
            tokens,
            _payload: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Full request URL for a target (branch / location id)
    pub fn url_for(&self, target_id: &str) -> Result<Url, PollingError> {
        let raw = format!("{}{}", self.base_url, self.endpoint.path);
        Url::parse_with_params(&raw, &[("sucursal_id", target_id)]).map_err(|e| {
            PollingError::Transport { status: None, message: format!("invalid URL {}: {}", raw, e) }
        })
    }

    /// Perform one GET, attaching the validator when the endpoint supports it.
    pub async fn fetch(&self, url: &str, last_validator: Option<&str>) -> FetchOutcome<T> {
        let Some(token) = self.tokens.token() else {
            return FetchOutcome::Failed(PollingError::Authentication(
                "no authentication token available".to_string(),
            ));
        };

        let mut request = self.client.get(url).bearer_auth(token);
        if self.endpoint.conditional {
            if let Some(validator) = last_validator {
                request = request.header(IF_NONE_MATCH, validator);
            }
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return FetchOutcome::Failed(e.into()),
        };

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => FetchOutcome::Unchanged,
            StatusCode::UNAUTHORIZED => FetchOutcome::Failed(PollingError::Authentication(
                "server rejected credentials".to_string(),
            )),
            s if s.is_success() => {
                let validator = if self.endpoint.conditional {
                    response
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                } else {
                    None
                };

                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => return FetchOutcome::Failed(e.into()),
                };

                match serde_json::from_slice::<T>(&body) {
                    Ok(payload) => FetchOutcome::Changed { payload, validator },
                    Err(e) => FetchOutcome::Failed(PollingError::Decode(e.to_string())),
                }
            }
            s => FetchOutcome::Failed(PollingError::Transport {
                status: Some(s.as_u16()),
                message: s.canonical_reason().unwrap_or("unexpected status").to_string(),
            }),
        }
    }
}

#[async_trait]
impl<T> PollSource for ConditionalFetcher<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Payload = T;

    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn poll(&self, target_id: &str, validator: Option<&str>) -> FetchOutcome<T> {
        match self.url_for(target_id) {
            Ok(url) => self.fetch(url.as_str(), validator).await,
            Err(e) => FetchOutcome::Failed(e),
        }
    }
}
