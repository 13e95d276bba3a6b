pub mod backoff;
pub mod degradation;
pub mod engine;
pub mod fetcher;
pub mod scheduler;
pub mod types;
pub mod visibility;

pub use backoff::{BackoffController, FailureVerdict};
pub use degradation::DegradationCache;
pub use engine::{EngineStatus, PollingEngine, PollingEngineBuilder};
pub use fetcher::{build_http_client, AlertsFetcher, ConditionalFetcher, Endpoint, TimersFetcher};
pub use scheduler::{JitteredScheduler, ScheduleHandle};
pub use types::{DataCallback, ErrorCallback, FetchOutcome, PollSource, PollingError};
pub use visibility::{Visibility, VisibilityGate, VisibilitySignal};
