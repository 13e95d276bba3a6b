use std::sync::Arc;
use std::time::Duration;

use super::MetricsRegistry;

/// Collector for one polling engine's metrics, labelled by endpoint
#[derive(Clone)]
pub struct PollMetricsCollector {
    metrics: Arc<MetricsRegistry>,
    endpoint: String,
}

impl PollMetricsCollector {
    pub fn new(metrics: Arc<MetricsRegistry>, endpoint: impl Into<String>) -> Self {
        Self { metrics, endpoint: endpoint.into() }
    }

    /// `outcome` is one of `unchanged`, `changed`, or a failure kind
    pub fn record_poll(&self, outcome: &str, duration: Duration) {
        self.metrics
            .poll_requests_total
            .with_label_values(&[self.endpoint.as_str(), outcome])
            .inc();

        self.metrics
            .poll_request_duration_seconds
            .with_label_values(&[self.endpoint.as_str()])
            .observe(duration.as_secs_f64());
    }

    pub fn set_interval(&self, interval: Duration) {
        self.metrics
            .poll_interval_seconds
            .with_label_values(&[self.endpoint.as_str()])
            .set(interval.as_secs_f64());
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.metrics
            .poll_degraded
            .with_label_values(&[self.endpoint.as_str()])
            .set(if degraded { 1.0 } else { 0.0 });
    }

    pub fn set_running(&self, running: bool) {
        self.metrics
            .poll_engine_running
            .with_label_values(&[self.endpoint.as_str()])
            .set(if running { 1.0 } else { 0.0 });
    }

    pub fn record_alert_surfaced(&self) {
        self.metrics.alerts_surfaced_total.inc();
    }

    pub fn record_acknowledgement(&self, success: bool) {
        self.metrics
            .alert_acknowledgements_total
            .with_label_values(&[if success { "ok" } else { "error" }])
            .inc();
    }
}
