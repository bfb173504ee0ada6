use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use sentry::ClientInitGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "badge_proxy";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("could not initialize logging: {0}")]
    Logging(String),
    #[error("could not initialize metrics: {0}")]
    Metrics(String),
}

/// The returned guard flushes pending events when dropped, so it must outlive
/// the server.
pub fn init_sentry(config: &LoggingConfig) -> Option<ClientInitGuard> {
    let dsn = config.sentry_dsn.as_deref()?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .try_init()
        .map_err(|e| TelemetryError::Logging(e.to_string()))
}

pub fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;

    metrics::set_global_recorder(recorder)
        .map_err(|_| TelemetryError::Metrics("a metrics recorder is already installed".into()))?;
    shared::metrics_defs::describe_all(proxy::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentry_disabled_without_dsn() {
        assert!(init_sentry(&LoggingConfig::default()).is_none());
    }
}
