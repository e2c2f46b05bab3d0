use crate::core::TelemetryConfig;
use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize logging with a reloadable level. JSON lines unless the config
/// asks for the human-readable format. Logs go to stderr so command output
/// on stdout stays machine-readable.
pub fn init_tracing(config: &TelemetryConfig) -> Result<LogHandle> {
    let (filter_layer, handle) = reload::Layer::new(build_filter(config.log_level.as_deref()));
    let registry = tracing_subscriber::registry().with(filter_layer);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::UtcTime::rfc_3339()),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::UtcTime::rfc_3339()),
            )
            .try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Swap the active filter, e.g. `courier=debug`.
pub fn set_log_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {level}"))?;
    handle
        .modify(|f| *f = filter)
        .map_err(|e| anyhow::anyhow!("failed to reload log level: {e}"))
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    let level = level.unwrap_or("info");
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
