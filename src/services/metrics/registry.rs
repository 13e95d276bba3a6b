use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Central metrics registry for the sync client
pub struct MetricsRegistry {
    registry: Registry,

    // Poll Metrics
    pub poll_requests_total: CounterVec,
    pub poll_request_duration_seconds: HistogramVec,
    pub poll_interval_seconds: GaugeVec,
    pub poll_degraded: GaugeVec,
    pub poll_engine_running: GaugeVec,

    // Alert Metrics
    pub alerts_surfaced_total: IntCounter,
    pub alert_acknowledgements_total: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let poll_requests_total = CounterVec::new(
            Opts::new("poll_requests_total", "Poll requests by outcome").namespace("timer_sync"),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(poll_requests_total.clone()))?;

        let poll_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("poll_request_duration_seconds", "Poll request duration")
                .namespace("timer_sync")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;
        registry.register(Box::new(poll_request_duration_seconds.clone()))?;

        let poll_interval_seconds = GaugeVec::new(
            Opts::new("poll_interval_seconds", "Current adaptive poll interval")
                .namespace("timer_sync"),
            &["endpoint"],
        )?;
        registry.register(Box::new(poll_interval_seconds.clone()))?;

        let poll_degraded = GaugeVec::new(
            Opts::new("poll_degraded", "1 while serving cached data after repeated failures")
                .namespace("timer_sync"),
            &["endpoint"],
        )?;
        registry.register(Box::new(poll_degraded.clone()))?;

        let poll_engine_running = GaugeVec::new(
            Opts::new("poll_engine_running", "1 while the polling engine is running")
                .namespace("timer_sync"),
            &["endpoint"],
        )?;
        registry.register(Box::new(poll_engine_running.clone()))?;

        let alerts_surfaced_total = IntCounter::with_opts(
            Opts::new("alerts_surfaced_total", "Distinct alerts delivered to the consumer")
                .namespace("timer_sync"),
        )?;
        registry.register(Box::new(alerts_surfaced_total.clone()))?;

        let alert_acknowledgements_total = CounterVec::new(
            Opts::new("alert_acknowledgements_total", "Alert acknowledge RPCs by result")
                .namespace("timer_sync"),
            &["result"],
        )?;
        registry.register(Box::new(alert_acknowledgements_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            poll_requests_total,
            poll_request_duration_seconds,
            poll_interval_seconds,
            poll_degraded,
            poll_engine_running,
            alerts_surfaced_total,
            alert_acknowledgements_total,
        }))
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Get the underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
