use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize tracing for the supervisor process.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = env_filter(&config.log_level);
    if config.json_logs {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    }

    tracing::info!("meshherd telemetry initialized");
    Ok(())
}

/// Initialize tracing for a worker process.
///
/// Workers log to stderr: their stdout is the IPC channel back to the
/// supervisor and must carry protocol lines only.
pub fn init_worker_telemetry(config: &ObservabilityConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(&config.log_level))
        .init();
    Ok(())
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
