pub mod acknowledge;
pub mod deduplicator;

pub use acknowledge::AcknowledgeClient;
pub use deduplicator::AlertDeduplicator;
