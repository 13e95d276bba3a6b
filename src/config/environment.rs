use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::polling_config::{load_polling_configs, PollingConfig};
use super::ConfigError;

/// Environment configuration for the sync daemon
/// Loads and validates environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub sucursal_id: String,
    pub api_token: Option<String>,
    pub api_token_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub timers: PollingConfig,
    pub alerts: PollingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_base_url = env::var("SYNC_API_BASE_URL")
            .map_err(|_| ConfigError::MissingVar("SYNC_API_BASE_URL"))?
            .trim_end_matches('/')
            .to_string();

        let sucursal_id = env::var("SYNC_SUCURSAL_ID")
            .map_err(|_| ConfigError::MissingVar("SYNC_SUCURSAL_ID"))?;

        let api_token = env::var("SYNC_API_TOKEN").ok().filter(|t| !t.is_empty());
        let api_token_file = env::var("SYNC_API_TOKEN_FILE").ok().map(PathBuf::from);

        let request_timeout_ms = match env::var("SYNC_REQUEST_TIMEOUT_MS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("SYNC_REQUEST_TIMEOUT_MS is not a number: {}", raw))
            })?,
            Err(_) => 10_000,
        };

        let mut configs = match env::var("SYNC_POLLING_CONFIG") {
            Ok(path) => load_polling_configs(&path)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            api_base_url,
            sucursal_id,
            api_token,
            api_token_file,
            request_timeout: Duration::from_millis(request_timeout_ms),
            timers: configs.remove("timers").unwrap_or_else(PollingConfig::timers),
            alerts: configs.remove("alerts").unwrap_or_else(PollingConfig::alerts),
        })
    }
}
