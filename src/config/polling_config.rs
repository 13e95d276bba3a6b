use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::ConfigError;

/// Tuning knobs for one polling engine. Immutable once the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    /// Growth factor applied after sustained "unchanged" responses
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Total width of the symmetric jitter window (±half on each side)
    #[serde(default = "default_jitter_range")]
    pub jitter_range_ms: u64,
    /// Base of the exponential error backoff; falls back to `initial_interval_ms`
    #[serde(default)]
    pub error_backoff_base_ms: Option<u64>,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: u32,
}

fn default_min_interval() -> u64 {
    5_000
}

fn default_max_interval() -> u64 {
    30_000
}

fn default_initial_interval() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_jitter_range() -> u64 {
    1_000
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_degradation_threshold() -> u32 {
    3
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::timers()
    }
}

impl PollingConfig {
    /// Preset for the full-state active timers feed
    pub fn timers() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            max_interval_ms: default_max_interval(),
            initial_interval_ms: default_initial_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_range_ms: default_jitter_range(),
            error_backoff_base_ms: None,
            max_consecutive_errors: default_max_consecutive_errors(),
            degradation_threshold: default_degradation_threshold(),
        }
    }

    /// Preset for the pending alerts feed. Alerts tolerate a slower cadence.
    pub fn alerts() -> Self {
        Self {
            min_interval_ms: 10_000,
            max_interval_ms: 60_000,
            initial_interval_ms: 10_000,
            jitter_range_ms: 2_000,
            ..Self::timers()
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn jitter_range(&self) -> Duration {
        Duration::from_millis(self.jitter_range_ms)
    }

    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_millis(self.error_backoff_base_ms.unwrap_or(self.initial_interval_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval_ms == 0 {
            return Err(ConfigError::Invalid("min_interval_ms must be positive".into()));
        }
        if self.min_interval_ms > self.initial_interval_ms
            || self.initial_interval_ms > self.max_interval_ms
        {
            return Err(ConfigError::Invalid(format!(
                "intervals must satisfy min <= initial <= max (got {} / {} / {})",
                self.min_interval_ms, self.initial_interval_ms, self.max_interval_ms
            )));
        }
        if !(self.backoff_multiplier > 1.0) || !self.backoff_multiplier.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be a finite value > 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.error_backoff_base_ms == Some(0) {
            return Err(ConfigError::Invalid("error_backoff_base_ms must be positive".into()));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid("max_consecutive_errors must be at least 1".into()));
        }
        if self.degradation_threshold == 0 {
            return Err(ConfigError::Invalid("degradation_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load polling configs keyed by consumer name (e.g. `"timers"`, `"alerts"`)
/// from a JSON file, substituting `${VAR_NAME}` with environment values first.
pub fn load_polling_configs(path: &str) -> Result<HashMap<String, PollingConfig>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path, e)))?;
    parse_polling_configs(&content)
}

pub fn parse_polling_configs(content: &str) -> Result<HashMap<String, PollingConfig>, ConfigError> {
    let content = substitute_env_vars(content)?;
    let configs: HashMap<String, PollingConfig> = serde_json::from_str(&content)?;

    for (name, config) in &configs {
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", name, e)))?;
    }

    Ok(configs)
}

/// Substitute ${VAR_NAME} with environment variable values
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&format!("${{{}}}", var_name), &value);
        }
    }

    Ok(result)
}
