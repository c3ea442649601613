//! `tracing-subscriber` setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

/// Filter directive: `SPIRE_LOG`, then `RUST_LOG`, then the configured level.
fn directive(config: &LoggingConfig) -> String {
    ["SPIRE_LOG", "RUST_LOG"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| config.level.clone())
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let directive = directive(config);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directive:?}: {e}"))?;
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }
    Ok(())
}
