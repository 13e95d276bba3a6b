pub mod collectors;
pub mod registry;

pub use collectors::PollMetricsCollector;
pub use registry::MetricsRegistry;
