//! Logging setup for the archive daemon.
//!
//! `RUST_LOG` overrides the configured level. Metrics go through the global
//! OpenTelemetry meter provider; without an exporter installed they are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waddle_mam::config::LoggingConfig;

const DEFAULT_FILTER: &str = "waddle_mam=debug,waddle_mam_server=debug";

fn filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", logging.level, DEFAULT_FILTER)))
}

/// Install the global subscriber: human readable, or one JSON object per line.
pub fn init(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(filter(logging));

    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    tracing::debug!(level = %logging.level, json = logging.json, "Telemetry initialized");
    Ok(())
}
