pub mod config;
pub mod modules;
pub mod services;

pub use config::{Config, PollingConfig};
pub use modules::timers::{AlertRecord, TimerSnapshot};
pub use services::alerts::{AcknowledgeClient, AlertDeduplicator};
pub use services::polling::{
    ConditionalFetcher, Endpoint, EngineStatus, FetchOutcome, PollSource, PollingEngine,
    PollingError, Visibility, VisibilitySignal,
};
