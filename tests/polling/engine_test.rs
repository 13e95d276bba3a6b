// =============================================================================
// INTEGRATION TESTS - ADAPTIVE POLLING ENGINE
// Interval adaptation, degradation replay, self-termination, visibility gating
// =============================================================================

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::{changed, failed, settle, test_config, wait_until, Recorder, ScriptedSource};
use timer_sync::config::PollingConfig;
use timer_sync::services::metrics::MetricsRegistry;
use timer_sync::services::polling::{FetchOutcome, PollingEngine, PollingError, VisibilitySignal};

fn assert_gap(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    let diff = if actual > expected { actual - expected } else { expected - actual };
    assert!(
        diff <= Duration::from_millis(2),
        "gap {:?} differs from expected {:?}",
        actual,
        expected
    );
}

fn engine_with(source: ScriptedSource<String>, config: PollingConfig) -> PollingEngine<ScriptedSource<String>> {
    PollingEngine::new(source, config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_then_changed_scenario() {
    let source = ScriptedSource::new(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(changed("A".to_string(), "\"v1\""));
    let engine = engine_with(source, test_config());
    let data: Recorder<String> = Recorder::new();

    let sink = data.clone();
    engine.start("3", move |payload: String| sink.record(payload), None);

    wait_until(|| engine.source().call_count() >= 3, Duration::from_secs(60)).await;
    settle().await;

    // First request is immediate, then 5000ms, then 7500ms after two unchanged
    let gaps = engine.source().gaps();
    assert_gap(gaps[0], 5_000);
    assert_gap(gaps[1], 7_500);

    assert_eq!(data.seen(), vec!["A".to_string()]);
    let status = engine.status();
    assert_eq!(status.current_interval, Duration::from_secs(5));
    assert_eq!(status.last_validator.as_deref(), Some("\"v1\""));

    // The stored validator rides along on the next request
    wait_until(|| engine.source().call_count() >= 4, Duration::from_secs(60)).await;
    let calls = engine.source().calls();
    assert_eq!(calls[0].validator, None);
    assert_eq!(calls[3].validator.as_deref(), Some("\"v1\""));
    assert_eq!(calls[3].target_id, "3");
    assert_eq!(data.count(), 1);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_jittered_intervals_stay_within_window() {
    let source = ScriptedSource::new(FetchOutcome::Unchanged);
    let config = PollingConfig { jitter_range_ms: 1_000, ..test_config() };
    let engine = engine_with(source, config);

    engine.start("3", |_: String| {}, None);
    wait_until(|| engine.source().call_count() >= 3, Duration::from_secs(60)).await;

    let gaps = engine.source().gaps();
    assert!(gaps[0] >= Duration::from_millis(4_499) && gaps[0] <= Duration::from_millis(5_501));
    assert!(gaps[1] >= Duration::from_millis(6_999) && gaps[1] <= Duration::from_millis(8_001));

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_backoff_grows_and_clamps() {
    let engine = engine_with(ScriptedSource::new(FetchOutcome::Unchanged), test_config());
    engine.start("3", |_: String| {}, None);

    wait_until(|| engine.source().call_count() >= 8, Duration::from_secs(300)).await;

    let gaps = engine.source().gaps();
    assert_gap(gaps[0], 5_000);
    assert_gap(gaps[1], 7_500);
    assert_gap(gaps[2], 11_250);
    assert_gap(gaps[3], 16_875);
    assert_gap(gaps[5], 30_000);
    assert_gap(gaps[6], 30_000);
    assert_eq!(engine.status().current_interval, Duration::from_secs(30));

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_single_change_resets_interval() {
    let source = ScriptedSource::new(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(changed("fresh".to_string(), "\"v2\""));
    let engine = engine_with(source, test_config());
    engine.start("3", |_: String| {}, None);

    wait_until(|| engine.source().call_count() >= 5, Duration::from_secs(120)).await;
    settle().await;
    assert!(engine.status().current_interval > Duration::from_secs(5));

    wait_until(|| engine.source().call_count() >= 6, Duration::from_secs(120)).await;
    settle().await;
    let status = engine.status();
    assert_eq!(status.current_interval, Duration::from_secs(5));
    assert_eq!(status.consecutive_unchanged, 0);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_degradation_replays_last_payload_once_per_crossing() {
    let source = ScriptedSource::new(FetchOutcome::Unchanged)
        .then(changed("A".to_string(), "\"v1\""))
        .then(failed())
        .then(failed())
        .then(failed())
        .then(changed("B".to_string(), "\"v2\""))
        .then(failed())
        .then(failed());
    let engine = engine_with(source, test_config());
    let data: Recorder<String> = Recorder::new();
    let errors: Recorder<PollingError> = Recorder::new();

    let (data_sink, error_sink) = (data.clone(), errors.clone());
    engine.start(
        "3",
        move |payload: String| data_sink.record(payload),
        Some(Box::new(move |e: &PollingError| error_sink.record(e.clone()))),
    );

    // One failure: error reported, no replay yet
    wait_until(|| engine.source().call_count() >= 2, Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(data.seen(), vec!["A"]);
    assert_eq!(errors.count(), 1);

    // Threshold crossed: last good payload replayed exactly once
    wait_until(|| engine.source().call_count() >= 3, Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(data.seen(), vec!["A", "A"]);
    assert!(engine.status().degraded_since.is_some());

    // Still failing: no second replay
    wait_until(|| engine.source().call_count() >= 4, Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(data.seen(), vec!["A", "A"]);
    assert_eq!(errors.count(), 3);

    // Recovery, then a fresh crossing replays the newer payload
    wait_until(|| engine.source().call_count() >= 7, Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(data.seen(), vec!["A", "A", "B", "B"]);
    assert_eq!(errors.count(), 5);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_error_backoff_is_exponential_from_initial() {
    let engine = engine_with(ScriptedSource::new(failed()), test_config());
    engine.start("3", |_: String| {}, None);

    wait_until(|| engine.source().call_count() >= 5, Duration::from_secs(300)).await;

    let gaps = engine.source().gaps();
    assert_gap(gaps[0], 5_000);
    assert_gap(gaps[1], 10_000);
    assert_gap(gaps[2], 20_000);
    assert_gap(gaps[3], 30_000);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_self_terminates_after_max_consecutive_errors() {
    let engine = engine_with(ScriptedSource::new(failed()), test_config());
    let errors: Recorder<PollingError> = Recorder::new();

    let sink = errors.clone();
    engine.start(
        "3",
        |_: String| {},
        Some(Box::new(move |e: &PollingError| sink.record(e.clone()))),
    );

    wait_until(|| !engine.is_running(), Duration::from_secs(600)).await;
    tokio::time::sleep(Duration::from_secs(3_600)).await;

    assert_eq!(engine.source().call_count(), 10);
    assert_eq!(errors.count(), 10);
    let status = engine.status();
    assert!(!status.is_running);
    assert_eq!(status.error_count, 10);
    assert!(matches!(status.last_error, Some(PollingError::Transport { status: Some(503), .. })));
}

#[tokio::test(start_paused = true)]
async fn test_auth_errors_share_the_failure_path() {
    let source = ScriptedSource::new(FetchOutcome::Failed(PollingError::Authentication(
        "server rejected credentials".into(),
    )));
    let config = PollingConfig { max_consecutive_errors: 3, ..test_config() };
    let engine = engine_with(source, config);

    engine.start("3", |_: String| {}, None);
    wait_until(|| !engine.is_running(), Duration::from_secs(120)).await;

    let gaps = engine.source().gaps();
    assert_eq!(engine.source().call_count(), 3);
    assert_gap(gaps[0], 5_000);
    assert_gap(gaps[1], 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_hidden_tab_pauses_and_visible_polls_immediately() {
    let signal = VisibilitySignal::default();
    let source = ScriptedSource::new(FetchOutcome::Unchanged).then(changed("A".to_string(), "\"v1\""));
    let engine = PollingEngine::builder(source, test_config())
        .visibility(signal.subscribe())
        .build()
        .unwrap();

    engine.start("3", |_: String| {}, None);
    settle().await;
    assert_eq!(engine.source().call_count(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    signal.set_hidden();
    settle().await;
    assert!(engine.is_paused());

    // The pending poll at 5s was cancelled
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.source().call_count(), 1);

    signal.set_visible();
    settle().await;
    assert_eq!(engine.source().call_count(), 2);
    assert!(!engine.is_paused());

    let gaps = engine.source().gaps();
    assert_gap(gaps[0], 61_000);

    // Regular cadence resumes afterwards
    wait_until(|| engine.source().call_count() >= 3, Duration::from_secs(60)).await;
    assert_gap(engine.source().gaps()[1], 5_000);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_are_idempotent() {
    let engine = engine_with(ScriptedSource::new(FetchOutcome::Unchanged), test_config());
    engine.start("3", |_: String| {}, None);
    settle().await;

    engine.pause();
    engine.pause();
    settle().await;
    assert!(engine.is_paused());
    assert!(engine.status().is_paused);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.source().call_count(), 1);

    engine.resume();
    engine.resume();
    settle().await;
    assert_eq!(engine.source().call_count(), 2);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(engine.source().call_count(), 2);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_force_poll_bypasses_backoff() {
    let engine = engine_with(ScriptedSource::new(FetchOutcome::Unchanged), test_config());
    engine.start("3", |_: String| {}, None);

    wait_until(|| engine.source().call_count() >= 4, Duration::from_secs(120)).await;
    settle().await;
    assert!(engine.status().current_interval > Duration::from_secs(10));

    engine.force_poll();
    settle().await;
    assert_eq!(engine.source().call_count(), 5);

    let status = engine.status();
    assert_eq!(status.current_interval, Duration::from_secs(5));
    assert_eq!(status.consecutive_unchanged, 1);

    wait_until(|| engine.source().call_count() >= 6, Duration::from_secs(60)).await;
    assert_gap(engine.source().gaps()[4], 5_000);

    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_interval_and_counter_invariants_hold() {
    let config = test_config();
    let source = ScriptedSource::new(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(failed())
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(FetchOutcome::Unchanged)
        .then(failed())
        .then(failed())
        .then(failed())
        .then(changed("x".to_string(), "\"v\""))
        .then(failed());
    let engine = engine_with(source, config.clone());

    let mut statuses = engine.subscribe_status();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while statuses.changed().await.is_ok() {
            seen.push(statuses.borrow_and_update().clone());
            if seen.len() >= 12 {
                break;
            }
        }
        seen
    });

    engine.start("3", |_: String| {}, None);
    wait_until(|| engine.source().call_count() >= 12, Duration::from_secs(600)).await;
    settle().await;
    engine.stop();

    drop(engine);

    let seen = observer.await.unwrap();
    assert!(!seen.is_empty());
    for status in seen {
        assert!(status.current_interval >= config.min_interval());
        assert!(status.current_interval <= config.max_interval());
        assert!(
            status.consecutive_unchanged == 0
                || (status.error_count == 0 && status.consecutive_failures == 0),
            "counters overlap: {:?}",
            status
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_metrics_follow_poll_outcomes() {
    let registry = MetricsRegistry::new().unwrap();
    let source = ScriptedSource::new(FetchOutcome::Unchanged)
        .then(changed("A".to_string(), "\"v1\""))
        .then(failed());
    let engine = PollingEngine::builder(source, test_config())
        .metrics(registry.clone())
        .build()
        .unwrap();

    engine.start("3", |_: String| {}, None);
    wait_until(|| engine.source().call_count() >= 4, Duration::from_secs(120)).await;
    settle().await;

    let count = |outcome: &str| {
        registry
            .poll_requests_total
            .with_label_values(&["scripted", outcome])
            .get()
    };
    assert_eq!(count("changed"), 1.0);
    assert_eq!(count("transport"), 1.0);
    assert_eq!(count("unchanged"), 2.0);
    assert_eq!(
        registry.poll_engine_running.with_label_values(&["scripted"]).get(),
        1.0
    );

    engine.stop();
    assert_eq!(
        registry.poll_engine_running.with_label_values(&["scripted"]).get(),
        0.0
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = PollingConfig { min_interval_ms: 10_000, ..test_config() };
    let result = PollingEngine::new(ScriptedSource::<String>::new(FetchOutcome::Unchanged), config);
    assert!(result.is_err());
}

/// fmt writer that keeps everything logged in memory
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_degradation_on_first_failure_logs_warning() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let source = ScriptedSource::new(failed()).then(changed("A".to_string(), "\"v1\""));
    let config = PollingConfig { degradation_threshold: 1, ..test_config() };
    let engine = engine_with(source, config);
    let data: Recorder<String> = Recorder::new();

    let sink = data.clone();
    engine.start("3", move |payload: String| sink.record(payload), None);
    wait_until(|| engine.source().call_count() >= 2, Duration::from_secs(60)).await;
    settle().await;
    engine.stop();

    assert_eq!(data.seen(), vec!["A", "A"]);

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let degraded: Vec<&str> = output.lines().filter(|l| l.contains("Polling degraded")).collect();
    assert_eq!(degraded.len(), 1, "logs:\n{}", output);
    assert!(degraded[0].contains("WARN"));
}
