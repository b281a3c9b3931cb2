use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::TelemetryConfig;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Fails if a global
/// subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = build_env_filter(&config.log_level);

    let registry = tracing_subscriber::registry().with(env_filter);

    let init_result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_current_span(true);
        registry.with(fmt_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        registry.with(fmt_layer).try_init()
    };

    init_result.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(service = %config.service_name, json = config.json, "telemetry initialized");
    Ok(())
}

fn build_env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}
