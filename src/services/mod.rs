pub mod alerts;
pub mod auth;
pub mod metrics;
pub mod polling;
