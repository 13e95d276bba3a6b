use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Schedules a single deferred callback at `delay ± jitter_range / 2`.
///
/// Jitter keeps many clients polling the same endpoint at the same adaptive
/// interval from lining up on round interval boundaries.
#[derive(Debug, Clone)]
pub struct JitteredScheduler {
    jitter_range: Duration,
}

/// Pending callback. Dropping the handle cancels it.
#[derive(Debug)]
pub struct ScheduleHandle {
    task: JoinHandle<()>,
    delay: Duration,
}

impl ScheduleHandle {
    /// Delay actually used after jitter was applied
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl JitteredScheduler {
    pub fn new(jitter_range: Duration) -> Self {
        Self { jitter_range }
    }

    /// Apply symmetric jitter: `max(0, delay + U(-range/2, +range/2))`
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_range.is_zero() {
            return delay;
        }

        let half = self.jitter_range.as_secs_f64() / 2.0;
        let offset = rand::rng().random_range(-half..=half);
        let secs = (delay.as_secs_f64() + offset).max(0.0);

        Duration::from_secs_f64(secs)
    }

    /// Run `callback` once after the jittered delay. Must be called inside a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> ScheduleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.jittered(delay);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });

        ScheduleHandle { task, delay }
    }

    pub fn cancel(&self, handle: ScheduleHandle) {
        drop(handle);
    }
}
