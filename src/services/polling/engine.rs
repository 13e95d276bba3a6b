use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backoff::BackoffController;
use super::degradation::DegradationCache;
use super::scheduler::{JitteredScheduler, ScheduleHandle};
use super::types::{DataCallback, ErrorCallback, FetchOutcome, PollSource, PollingError};
use super::visibility::{Visibility, VisibilityGate};
use crate::config::{ConfigError, PollingConfig};
use crate::services::metrics::{MetricsRegistry, PollMetricsCollector};

thread_local! {
    /// Run flags of the engine whose callback is executing on this thread, if any
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Point-in-time view of an engine, published after every state change
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub target_id: Option<String>,
    pub is_running: bool,
    pub is_paused: bool,
    pub current_interval: Duration,
    pub consecutive_unchanged: u32,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub last_validator: Option<String>,
    pub degraded_since: Option<Instant>,
    pub requests_issued: u64,
    pub last_error: Option<PollingError>,
}

impl EngineStatus {
    fn idle(config: &PollingConfig) -> Self {
        Self {
            target_id: None,
            is_running: false,
            is_paused: false,
            current_interval: config.initial_interval(),
            consecutive_unchanged: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_validator: None,
            degraded_since: None,
            requests_issued: 0,
            last_error: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Tick(u64),
    Pause,
    Resume,
    ForcePoll,
}

/// Flags of one run (one `start()` .. `stop()` span). A fresh set is created
/// on every start so a stale driver can never observe a later run as its own.
#[derive(Debug, Default)]
struct RunFlags {
    running: AtomicBool,
    paused: AtomicBool,
    /// Held while a consumer callback executes
    delivery: Mutex<()>,
}

impl RunFlags {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct Control {
    flags: Arc<RunFlags>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Control {
    fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) {
        if let Some(tx) = self.commands.upgrade() {
            let _ = tx.send(command);
        }
    }

    fn pause(&self) {
        if self.is_running() && !self.flags.paused.swap(true, Ordering::SeqCst) {
            self.send(Command::Pause);
        }
    }

    fn resume(&self) {
        if self.is_running() && self.flags.paused.swap(false, Ordering::SeqCst) {
            self.send(Command::Resume);
        }
    }

    fn force_poll(&self) {
        if self.is_running() {
            self.send(Command::ForcePoll);
        }
    }

    /// Flip the run off and wait out any callback already executing.
    ///
    /// A caller that is itself inside a callback of any engine does not wait:
    /// two engines stopping each other from their callbacks would otherwise
    /// block on each other's delivery lock.
    fn shut_off(&self) {
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.paused.store(false, Ordering::SeqCst);

        let delivering = DELIVERING.with(|d| d.get()) != 0;
        if !delivering {
            drop(self.flags.lock_delivery());
        }
    }
}

struct Session<S: PollSource> {
    control: Control,
    cache: DegradationCache<S::Payload>,
    _commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

struct Shared<S: PollSource> {
    source: Arc<S>,
    config: PollingConfig,
    scheduler: JitteredScheduler,
    metrics: Option<PollMetricsCollector>,
    status: watch::Sender<EngineStatus>,
}

struct EngineInner<S: PollSource> {
    shared: Arc<Shared<S>>,
    visibility: Option<watch::Receiver<Visibility>>,
    session: Mutex<Option<Session<S>>>,
    /// Cache of the most recent run, kept readable after it stops
    last_cache: Mutex<DegradationCache<S::Payload>>,
}

impl<S: PollSource> EngineInner<S> {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session<S>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_cache(&self) -> MutexGuard<'_, DegradationCache<S::Payload>> {
        self.last_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, session: Session<S>) {
        session.control.shut_off();
        session.driver.abort();

        self.shared.status.send_modify(|status| {
            status.is_running = false;
            status.is_paused = false;
        });
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_running(false);
        }
    }
}

impl<S: PollSource> Drop for EngineInner<S> {
    fn drop(&mut self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            self.teardown(session);
        }
    }
}

/// Adaptive conditional-polling engine.
///
/// Cloning yields another handle to the same engine, so callbacks may capture
/// a handle and call [`PollingEngine::stop`] from inside themselves. Each run
/// is driven by a single task that owns all mutable polling state; at most one
/// request is ever in flight.
pub struct PollingEngine<S: PollSource> {
    inner: Arc<EngineInner<S>>,
}

impl<S: PollSource> Clone for PollingEngine<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub struct PollingEngineBuilder<S: PollSource> {
    source: S,
    config: PollingConfig,
    visibility: Option<watch::Receiver<Visibility>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl<S: PollSource> PollingEngineBuilder<S> {
    /// Pause while hidden and resume (with an immediate poll) when visible again
    pub fn visibility(mut self, rx: watch::Receiver<Visibility>) -> Self {
        self.visibility = Some(rx);
        self
    }

    pub fn metrics(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(registry);
        self
    }

    pub fn build(self) -> Result<PollingEngine<S>, ConfigError> {
        self.config.validate()?;

        let metrics = self
            .metrics
            .map(|registry| PollMetricsCollector::new(registry, self.source.name()));
        let (status, _) = watch::channel(EngineStatus::idle(&self.config));

        let shared = Shared {
            scheduler: JitteredScheduler::new(self.config.jitter_range()),
            source: Arc::new(self.source),
            config: self.config,
            metrics,
            status,
        };

        Ok(PollingEngine {
            inner: Arc::new(EngineInner {
                shared: Arc::new(shared),
                visibility: self.visibility,
                session: Mutex::new(None),
                last_cache: Mutex::new(DegradationCache::new()),
            }),
        })
    }
}

impl<S: PollSource> PollingEngine<S> {
    pub fn builder(source: S, config: PollingConfig) -> PollingEngineBuilder<S> {
        PollingEngineBuilder { source, config, visibility: None, metrics: None }
    }

    pub fn new(source: S, config: PollingConfig) -> Result<Self, ConfigError> {
        Self::builder(source, config).build()
    }

    pub fn config(&self) -> &PollingConfig {
        &self.inner.shared.config
    }

    pub fn source(&self) -> &S {
        &self.inner.shared.source
    }

    /// Last successfully decoded payload of the current (or most recent) run.
    /// Every run gets a fresh cache; a stopped run never writes into a later one.
    pub fn cache(&self) -> DegradationCache<S::Payload> {
        self.inner.lock_last_cache().clone()
    }

    /// Begin polling `target_id`. The first request goes out immediately.
    ///
    /// Starting a running engine stops the previous run first; every start
    /// resets counters, validator and cached payload. Must be called inside a
    /// tokio runtime.
    pub fn start<F>(&self, target_id: impl Into<String>, on_data: F, on_error: Option<ErrorCallback>)
    where
        F: Fn(S::Payload) + Send + Sync + 'static,
    {
        let target_id = target_id.into();
        let shared = &self.inner.shared;

        let previous = self.inner.lock_session().take();
        if let Some(previous) = previous {
            if previous.control.is_running() {
                tracing::info!(
                    endpoint = shared.source.name(),
                    target_id = %target_id,
                    "Engine already running, stopping previous run before restart"
                );
            }
            self.inner.teardown(previous);
        }

        let cache = DegradationCache::new();
        let flags = Arc::new(RunFlags::default());
        flags.running.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let control = Control { flags, commands: tx.downgrade() };

        let gate = match &self.inner.visibility {
            Some(visibility) => {
                let on_visible = control.clone();
                let on_hidden = control.clone();
                VisibilityGate::attach(
                    visibility.clone(),
                    move || on_visible.resume(),
                    move || on_hidden.pause(),
                )
            }
            None => VisibilityGate::detached(),
        };

        let driver = Driver {
            shared: shared.clone(),
            control: control.clone(),
            commands: rx,
            gate,
            cache: cache.clone(),
            state: PollingState::new(target_id.clone(), &shared.config),
            on_data: Box::new(on_data),
            on_error,
        };
        driver.publish_status();
        if let Some(metrics) = &shared.metrics {
            metrics.set_running(true);
        }

        tracing::info!(
            endpoint = shared.source.name(),
            target_id = %target_id,
            "Polling started"
        );

        let session = Session {
            control,
            cache,
            _commands: tx,
            driver: tokio::spawn(driver.run()),
        };

        // A concurrent start may have slipped in while the lock was released
        let displaced = {
            let mut slot = self.inner.lock_session();
            *self.inner.lock_last_cache() = session.cache.clone();
            slot.replace(session)
        };
        if let Some(displaced) = displaced {
            self.inner.teardown(displaced);
        }
    }

    /// Stop polling and drop the callbacks. Idempotent, and safe to call from
    /// inside a callback. Once this returns no callback of the stopped run
    /// will be invoked again. Called from outside any callback, it also waits
    /// for a callback of this run that is already executing.
    pub fn stop(&self) {
        let session = self.inner.lock_session().take();
        if let Some(session) = session {
            let was_running = session.control.is_running();
            self.inner.teardown(session);
            if was_running {
                tracing::info!(endpoint = self.inner.shared.source.name(), "Polling stopped");
            }
        }
    }

    /// Cancel the pending poll and hold off scheduling. No-op unless running.
    pub fn pause(&self) {
        if let Some(session) = self.inner.lock_session().as_ref() {
            session.control.pause();
        }
    }

    /// Leave the paused state with an immediate poll. No-op unless paused.
    pub fn resume(&self) {
        if let Some(session) = self.inner.lock_session().as_ref() {
            session.control.resume();
        }
    }

    /// Poll now and reset the interval to its minimum, after a local action
    /// known to have changed server state.
    pub fn force_poll(&self) {
        if let Some(session) = self.inner.lock_session().as_ref() {
            session.control.force_poll();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|s| s.control.is_running())
    }

    pub fn is_paused(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|s| s.control.is_running() && s.control.is_paused())
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.shared.status.subscribe()
    }
}

/// Mutable state of one run, owned by its driver task
#[derive(Debug)]
struct PollingState {
    target_id: String,
    last_validator: Option<String>,
    backoff: BackoffController,
    pending: Option<ScheduleHandle>,
    ticket: u64,
    requests_issued: u64,
    last_error: Option<PollingError>,
}

impl PollingState {
    fn new(target_id: String, config: &PollingConfig) -> Self {
        Self {
            target_id,
            last_validator: None,
            backoff: BackoffController::new(config),
            pending: None,
            ticket: 0,
            requests_issued: 0,
            last_error: None,
        }
    }
}

struct Driver<S: PollSource> {
    shared: Arc<Shared<S>>,
    control: Control,
    commands: mpsc::UnboundedReceiver<Command>,
    gate: VisibilityGate,
    cache: DegradationCache<S::Payload>,
    state: PollingState,
    on_data: DataCallback<S::Payload>,
    on_error: Option<ErrorCallback>,
}

impl<S: PollSource> Driver<S> {
    async fn run(mut self) {
        self.poll_cycle().await;

        while self.control.is_running() {
            let Some(command) = self.commands.recv().await else {
                break;
            };

            match command {
                Command::Tick(ticket) => {
                    if ticket == self.state.ticket {
                        self.poll_cycle().await;
                    }
                }
                Command::Pause => {
                    self.cancel_pending();
                    tracing::debug!(endpoint = self.shared.source.name(), "Polling paused");
                    self.publish_status();
                }
                Command::Resume => {
                    tracing::debug!(endpoint = self.shared.source.name(), "Polling resumed");
                    self.poll_cycle().await;
                }
                Command::ForcePoll => {
                    self.cancel_pending();
                    self.state.backoff.force_min();
                    self.poll_cycle().await;
                }
            }
        }

        self.gate.detach();
        self.state.pending = None;
    }

    async fn poll_cycle(&mut self) {
        if !self.control.is_running() || self.control.is_paused() {
            return;
        }

        self.cancel_pending();
        self.state.requests_issued += 1;
        let started = Instant::now();

        let outcome = self
            .shared
            .source
            .poll(&self.state.target_id, self.state.last_validator.as_deref())
            .await;

        // Stopped while the request was in flight
        if !self.control.is_running() {
            return;
        }

        let elapsed = started.elapsed();
        match outcome {
            FetchOutcome::Unchanged => self.handle_unchanged(elapsed),
            FetchOutcome::Changed { payload, validator } => {
                self.handle_changed(payload, validator, elapsed)
            }
            FetchOutcome::Failed(error) => self.handle_failure(error, elapsed),
        }

        if self.control.is_running() {
            self.publish_status();
            self.schedule_next();
        }
    }

    fn handle_unchanged(&mut self, elapsed: Duration) {
        let recovered = self.state.backoff.record_unchanged();
        self.note_recovery(recovered);
        self.state.last_error = None;

        tracing::trace!(
            endpoint = self.shared.source.name(),
            interval_ms = self.state.backoff.current_interval().as_millis() as u64,
            unchanged = self.state.backoff.consecutive_unchanged(),
            "Poll unchanged"
        );
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_poll("unchanged", elapsed);
        }
    }

    fn handle_changed(&mut self, payload: S::Payload, validator: Option<String>, elapsed: Duration) {
        if !self.remember(payload.clone()) {
            return;
        }

        self.state.last_validator = validator;
        let recovered = self.state.backoff.record_changed();
        self.note_recovery(recovered);
        self.state.last_error = None;

        tracing::debug!(
            endpoint = self.shared.source.name(),
            target_id = %self.state.target_id,
            validator = ?self.state.last_validator,
            "Poll returned new data"
        );
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_poll("changed", elapsed);
        }

        self.deliver(payload);
    }

    fn handle_failure(&mut self, error: PollingError, elapsed: Duration) {
        let verdict = self.state.backoff.record_failure();
        let endpoint = self.shared.source.name();

        if let Some(degraded_for) = verdict.degraded_for {
            tracing::warn!(
                endpoint,
                error = %error,
                consecutive_failures = self.state.backoff.consecutive_failures(),
                degraded_ms = degraded_for.as_millis() as u64,
                "Polling degraded"
            );
        } else if verdict.first_failure {
            tracing::debug!(endpoint, error = %error, "Poll failed");
        } else {
            tracing::debug!(
                endpoint,
                error = %error,
                consecutive_failures = self.state.backoff.consecutive_failures(),
                "Poll failed again"
            );
        }

        if let Some(metrics) = &self.shared.metrics {
            metrics.record_poll(error.kind(), elapsed);
            metrics.set_degraded(self.state.backoff.is_degraded());
        }

        self.notify_error(&error);
        self.state.last_error = Some(error);

        if verdict.entered_degradation {
            if let Some(cached) = self.cache.get() {
                tracing::info!(endpoint, "Replaying last known good data");
                self.deliver(cached);
            }
        }

        if verdict.exhausted && self.control.is_running() {
            tracing::warn!(
                endpoint,
                target_id = %self.state.target_id,
                error_count = self.state.backoff.error_count(),
                "Too many consecutive errors, stopping polling"
            );
            self.terminate();
        }
    }

    fn note_recovery(&self, recovered: Option<Duration>) {
        if let Some(degraded_for) = recovered {
            tracing::info!(
                endpoint = self.shared.source.name(),
                degraded_ms = degraded_for.as_millis() as u64,
                "Polling recovered"
            );
            if let Some(metrics) = &self.shared.metrics {
                metrics.set_degraded(false);
            }
        }
    }

    /// Drop the pending timer and invalidate any tick it already sent
    fn cancel_pending(&mut self) {
        self.state.pending = None;
        self.state.ticket += 1;
    }

    fn schedule_next(&mut self) {
        if !self.control.is_running() || self.control.is_paused() {
            return;
        }

        self.state.ticket += 1;
        let ticket = self.state.ticket;
        let control = self.control.clone();
        let interval = self.state.backoff.current_interval();

        let handle = self
            .shared
            .scheduler
            .schedule(interval, move || control.send(Command::Tick(ticket)));

        tracing::trace!(
            endpoint = self.shared.source.name(),
            delay_ms = handle.delay().as_millis() as u64,
            "Next poll scheduled"
        );
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_interval(interval);
        }
        self.state.pending = Some(handle);
    }

    /// Self-termination after exhausting the error budget
    fn terminate(&mut self) {
        self.gate.detach();
        self.state.pending = None;
        self.control.flags.running.store(false, Ordering::SeqCst);
        self.control.flags.paused.store(false, Ordering::SeqCst);

        self.shared.status.send_modify(|status| {
            status.is_running = false;
            status.is_paused = false;
            status.error_count = self.state.backoff.error_count();
            status.consecutive_failures = self.state.backoff.consecutive_failures();
            status.requests_issued = self.state.requests_issued;
            status.last_error = self.state.last_error.clone();
        });
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_running(false);
        }
    }

    /// Store a fresh payload for degraded replay. Shares the delivery lock, so
    /// nothing is stored once the run has been stopped.
    fn remember(&self, payload: S::Payload) -> bool {
        let _guard = self.control.flags.lock_delivery();
        if !self.control.is_running() {
            return false;
        }
        self.cache.record(payload);
        true
    }

    fn deliver(&self, payload: S::Payload) {
        self.with_delivery(|| (self.on_data)(payload));
    }

    fn notify_error(&self, error: &PollingError) {
        if let Some(on_error) = &self.on_error {
            self.with_delivery(|| on_error(error));
        }
    }

    /// Invoke a consumer callback: never after stop, never concurrently with
    /// stop returning, and never letting a panic escape into the driver.
    fn with_delivery<F: FnOnce()>(&self, callback: F) {
        let flags = &self.control.flags;
        let _guard = flags.lock_delivery();
        if !self.control.is_running() {
            return;
        }

        let previous = DELIVERING.with(|d| d.replace(flags.id()));
        let result = catch_unwind(AssertUnwindSafe(callback));
        DELIVERING.with(|d| d.set(previous));

        if result.is_err() {
            tracing::error!(
                endpoint = self.shared.source.name(),
                "Consumer callback panicked; polling continues"
            );
        }
    }

    fn publish_status(&self) {
        let _guard = self.control.flags.lock_delivery();
        if !self.control.is_running() {
            return;
        }

        let backoff = &self.state.backoff;
        self.shared.status.send_replace(EngineStatus {
            target_id: Some(self.state.target_id.clone()),
            is_running: true,
            is_paused: self.control.is_paused(),
            current_interval: backoff.current_interval(),
            consecutive_unchanged: backoff.consecutive_unchanged(),
            error_count: backoff.error_count(),
            consecutive_failures: backoff.consecutive_failures(),
            last_validator: self.state.last_validator.clone(),
            degraded_since: backoff.degraded_since(),
            requests_issued: self.state.requests_issued,
            last_error: self.state.last_error.clone(),
        });
    }
}
