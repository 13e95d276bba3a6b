use std::time::Duration;
use tokio::time::Instant;

use crate::config::PollingConfig;

/// Number of back-to-back "unchanged" polls required before the interval grows
const UNCHANGED_BEFORE_GROWTH: u32 = 2;

/// Adaptive interval state machine.
///
/// Two regimes are tracked separately and never compound:
/// - "stable": repeated unchanged responses stretch the interval multiplicatively
/// - "failing": errors restart an exponential backoff from the error base
#[derive(Debug, Clone)]
pub struct BackoffController {
    min_interval: Duration,
    max_interval: Duration,
    error_base: Duration,
    multiplier: f64,
    max_consecutive_errors: u32,
    degradation_threshold: u32,

    current_interval: Duration,
    consecutive_unchanged: u32,
    error_count: u32,
    consecutive_failures: u32,
    degraded_since: Option<Instant>,
}

/// What the engine must do after a failed poll
#[derive(Debug, Clone, PartialEq)]
pub struct FailureVerdict {
    pub first_failure: bool,
    /// Threshold reached on exactly this failure: replay cached data now
    pub entered_degradation: bool,
    /// Set whenever the engine is degraded, with the time spent degraded so far
    pub degraded_for: Option<Duration>,
    /// Error budget exhausted: the engine must stop
    pub exhausted: bool,
}

impl BackoffController {
    pub fn new(config: &PollingConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            max_interval: config.max_interval(),
            error_base: config.error_backoff_base(),
            multiplier: config.backoff_multiplier,
            max_consecutive_errors: config.max_consecutive_errors,
            degradation_threshold: config.degradation_threshold,
            current_interval: config.initial_interval(),
            consecutive_unchanged: 0,
            error_count: 0,
            consecutive_failures: 0,
            degraded_since: None,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_unchanged(&self) -> u32 {
        self.consecutive_unchanged
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn degraded_since(&self) -> Option<Instant> {
        self.degraded_since
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_since.is_some()
    }

    /// Bias toward responsiveness after a local action known to change server state
    pub fn force_min(&mut self) {
        self.current_interval = self.min_interval;
        self.consecutive_unchanged = 0;
    }

    /// 304 response. Counts as a success for the error counters.
    /// Returns how long the engine had been degraded, if it was.
    pub fn record_unchanged(&mut self) -> Option<Duration> {
        let recovered = self.clear_failures();

        self.consecutive_unchanged += 1;
        if self.consecutive_unchanged >= UNCHANGED_BEFORE_GROWTH {
            let grown = self.current_interval.mul_f64(self.multiplier);
            self.current_interval = self.clamp(grown);
        }

        recovered
    }

    /// 200 response with a new payload.
    /// Returns how long the engine had been degraded, if it was.
    pub fn record_changed(&mut self) -> Option<Duration> {
        let recovered = self.clear_failures();
        self.current_interval = self.min_interval;
        self.consecutive_unchanged = 0;
        recovered
    }

    pub fn record_failure(&mut self) -> FailureVerdict {
        self.consecutive_unchanged = 0;
        self.error_count += 1;
        self.consecutive_failures += 1;

        // Exponent restarts from the error base, not from the drifted interval
        let exponent = (self.error_count - 1).min(31) as i32;
        let backoff = self.error_base.as_secs_f64() * 2_f64.powi(exponent);
        self.current_interval = self.clamp(Duration::from_secs_f64(
            backoff.min(self.max_interval.as_secs_f64()),
        ));

        let entered_degradation = self.consecutive_failures == self.degradation_threshold;
        let degraded_for = if self.consecutive_failures >= self.degradation_threshold {
            let since = *self.degraded_since.get_or_insert_with(Instant::now);
            Some(since.elapsed())
        } else {
            None
        };

        FailureVerdict {
            first_failure: self.consecutive_failures == 1,
            entered_degradation,
            degraded_for,
            exhausted: self.error_count >= self.max_consecutive_errors,
        }
    }

    fn clear_failures(&mut self) -> Option<Duration> {
        self.error_count = 0;
        self.consecutive_failures = 0;
        self.degraded_since.take().map(|since| since.elapsed())
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_interval, self.max_interval)
    }
}
