use std::sync::Arc;

use timer_sync::config::Config;
use timer_sync::modules::timers::{AlertRecord, TimerSnapshot};
use timer_sync::services::alerts::{AcknowledgeClient, AlertDeduplicator};
use timer_sync::services::auth::{FileToken, StaticToken, TokenSource};
use timer_sync::services::metrics::{MetricsRegistry, PollMetricsCollector};
use timer_sync::services::polling::{
    build_http_client, AlertsFetcher, ConditionalFetcher, Endpoint, PollingEngine, PollingError,
    TimersFetcher,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timer_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let tokens: Arc<dyn TokenSource> = match (&config.api_token, &config.api_token_file) {
        (Some(token), _) => Arc::new(StaticToken::new(token.clone())),
        (None, Some(path)) => Arc::new(FileToken::new(path.clone())),
        (None, None) => {
            tracing::warn!("No SYNC_API_TOKEN or SYNC_API_TOKEN_FILE set, requests will fail authentication");
            Arc::new(StaticToken::none())
        }
    };

    let metrics = MetricsRegistry::new()?;
    let client = build_http_client(config.request_timeout);

    let timers_fetcher: TimersFetcher = ConditionalFetcher::new(
        client.clone(),
        config.api_base_url.clone(),
        Endpoint::active_timers(),
        tokens.clone(),
    );
    let timers = PollingEngine::builder(timers_fetcher, config.timers.clone())
        .metrics(metrics.clone())
        .build()?;

    let alerts_fetcher: AlertsFetcher = ConditionalFetcher::new(
        client.clone(),
        config.api_base_url.clone(),
        Endpoint::pending_alerts(),
        tokens.clone(),
    );
    let alerts_engine = PollingEngine::builder(alerts_fetcher, config.alerts.clone())
        .metrics(metrics.clone())
        .build()?;
    let acknowledger = AcknowledgeClient::new(client, config.api_base_url.clone(), tokens)
        .with_metrics(PollMetricsCollector::new(metrics.clone(), "alerts"));
    let alerts = AlertDeduplicator::new(alerts_engine, acknowledger).with_metrics(metrics.clone());

    timers.start(
        config.sucursal_id.clone(),
        |snapshots: Vec<TimerSnapshot>| {
            tracing::info!("Active timers: {}", snapshots.len());
            for timer in &snapshots {
                tracing::debug!(timer_id = timer.id, status = ?timer.status, "Timer");
            }
        },
        Some(Box::new(|e: &PollingError| {
            tracing::debug!("Timers poll error: {}", e);
        })),
    );

    alerts.start(
        config.sucursal_id.clone(),
        |alert: AlertRecord| {
            tracing::warn!(
                "⏰ Timer {} reached its {} minute alert (status={})",
                alert.timer_id,
                alert.alert_threshold_minutes,
                alert.status
            );
        },
        None,
    );

    tracing::info!(
        "Syncing sucursal {} from {}",
        config.sucursal_id,
        config.api_base_url
    );

    let mut timers_status = timers.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = timers_status.changed() => {
                if changed.is_err() || !timers.is_running() {
                    tracing::error!("Timer sync stopped after repeated failures, shutting down");
                    break;
                }
            }
        }
    }

    timers.stop();
    alerts.stop();

    if let Ok(text) = metrics.export() {
        tracing::debug!("Final metrics:\n{}", text);
    }

    Ok(())
}
