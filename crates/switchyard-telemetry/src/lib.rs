//! Logging for Switchyard
//!
//! Installs a `tracing-subscriber` registry with an env filter and a text or
//! JSON `fmt` layer.

use switchyard_config::{LogFormat, TelemetryConfig};
use tracing_subscriber::EnvFilter;

/// Initialize logging from configuration
///
/// The filter is taken from `filter_override` if given, then `RUST_LOG`,
/// then the configured directive. An unparseable directive falls back to
/// `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: &TelemetryConfig, filter_override: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = build_filter(config, filter_override, std::env::var("RUST_LOG").ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match config.format {
        LogFormat::Text => registry.with(fmt_layer).try_init(),
        LogFormat::Json => registry.with(fmt_layer.json().flatten_event(true)).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn build_filter(config: &TelemetryConfig, filter_override: Option<&str>, env: Option<&str>) -> EnvFilter {
    let directive = filter_override
        .or(env.filter(|v| !v.trim().is_empty()))
        .unwrap_or(&config.filter);

    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}
