use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::acknowledge::AcknowledgeClient;
use crate::modules::timers::{AlertRecord, ShownAlertKey};
use crate::services::metrics::{MetricsRegistry, PollMetricsCollector};
use crate::services::polling::{ErrorCallback, PollSource, PollingEngine, PollingError};

/// Surfaces each pending alert once per subscription.
///
/// Every response from the alerts endpoint is a full candidate set; the engine
/// caches it whole (so a degraded replay resends the last known set) and this
/// layer filters out keys already surfaced. The shown set only grows until
/// [`AlertDeduplicator::stop`].
pub struct AlertDeduplicator<S>
where
    S: PollSource<Payload = Vec<AlertRecord>>,
{
    engine: PollingEngine<S>,
    acknowledger: AcknowledgeClient,
    shown: Arc<Mutex<HashSet<ShownAlertKey>>>,
    metrics: Option<PollMetricsCollector>,
}

impl<S> AlertDeduplicator<S>
where
    S: PollSource<Payload = Vec<AlertRecord>>,
{
    pub fn new(engine: PollingEngine<S>, acknowledger: AcknowledgeClient) -> Self {
        Self {
            engine,
            acknowledger,
            shown: Arc::new(Mutex::new(HashSet::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(PollMetricsCollector::new(registry, "alerts"));
        self
    }

    pub fn engine(&self) -> &PollingEngine<S> {
        &self.engine
    }

    /// Start polling `target_id`; `on_alert` fires once per new timer+threshold pair.
    pub fn start<F>(&self, target_id: impl Into<String>, on_alert: F, on_error: Option<ErrorCallback>)
    where
        F: Fn(AlertRecord) + Send + Sync + 'static,
    {
        let shown = self.shown.clone();
        let metrics = self.metrics.clone();

        self.engine.start(
            target_id,
            move |alerts: Vec<AlertRecord>| {
                let fresh: Vec<AlertRecord> = {
                    let mut shown = lock(&shown);
                    alerts
                        .into_iter()
                        .filter(|alert| shown.insert(alert.shown_key()))
                        .collect()
                };

                for alert in fresh {
                    tracing::info!(
                        timer_id = alert.timer_id,
                        threshold_minutes = alert.alert_threshold_minutes,
                        "Surfacing timer alert"
                    );
                    if let Some(metrics) = &metrics {
                        metrics.record_alert_surfaced();
                    }
                    if catch_unwind(AssertUnwindSafe(|| on_alert(alert))).is_err() {
                        tracing::error!("Alert callback panicked");
                    }
                }
            },
            on_error,
        );
    }

    /// Stop polling and forget which alerts were shown
    pub fn stop(&self) {
        self.engine.stop();
        lock(&self.shown).clear();
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    pub fn resume(&self) {
        self.engine.resume();
    }

    pub fn force_poll(&self) {
        self.engine.force_poll();
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn is_shown(&self, timer_id: i64, threshold_minutes: u32) -> bool {
        lock(&self.shown).contains(&ShownAlertKey::new(timer_id, threshold_minutes))
    }

    pub fn shown_count(&self) -> usize {
        lock(&self.shown).len()
    }

    /// Tell the server an alert was seen. Failures are returned to the caller
    /// and leave polling untouched.
    pub async fn acknowledge_alert(&self, timer_id: i64, threshold_minutes: u32) -> Result<(), PollingError> {
        self.acknowledger.acknowledge(timer_id, threshold_minutes).await
    }
}

fn lock(shown: &Mutex<HashSet<ShownAlertKey>>) -> MutexGuard<'_, HashSet<ShownAlertKey>> {
    shown.lock().unwrap_or_else(PoisonError::into_inner)
}
