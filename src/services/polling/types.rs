use async_trait::async_trait;

/// Classified result of a single poll request
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// 304: the server's copy matches our validator
    Unchanged,
    /// 200: a freshly decoded payload and the validator that identifies it
    Changed { payload: T, validator: Option<String> },
    Failed(PollingError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollingError {
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Transport error{}: {message}", status_suffix(.status))]
    Transport { status: Option<u16>, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Request timeout")]
    Timeout,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl PollingError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication(_) => Some(401),
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "auth",
            Self::Transport { .. } => "transport",
            Self::Decode(_) => "decode",
            Self::Timeout => "timeout",
        }
    }
}

impl From<reqwest::Error> for PollingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// What a polling engine polls: one endpoint plus its response decoding.
///
/// Implementations must be cheap to call repeatedly and must never panic;
/// every failure is reported as [`FetchOutcome::Failed`].
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    /// Label used in logs and metrics
    fn name(&self) -> &str;

    async fn poll(&self, target_id: &str, validator: Option<&str>) -> FetchOutcome<Self::Payload>;
}

pub type DataCallback<T> = Box<dyn Fn(T) + Send + Sync + 'static>;
pub type ErrorCallback = Box<dyn Fn(&PollingError) + Send + Sync + 'static>;
