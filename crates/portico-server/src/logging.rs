//! Structured logging setup

use std::collections::HashMap;

use anyhow::{Context, Result};
use portico_config::{LogLevel, LoggingConfig};
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Build the filter from a base directive plus per-module levels.
pub fn build_filter(base: &str, module_levels: &HashMap<String, LogLevel>) -> Result<EnvFilter> {
    let mut filter =
        EnvFilter::try_new(base).with_context(|| format!("Invalid log level: {}", base))?;

    for (module, level) in module_levels {
        let directive = format!("{}={}", module, level.as_str());
        filter = filter.add_directive(
            directive
                .parse::<Directive>()
                .with_context(|| format!("Invalid directive: {}", directive))?,
        );
    }

    Ok(filter)
}

/// Install the global subscriber. `level_override` (CLI / `RUST_LOG`) replaces
/// the configured base level; module levels still apply.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let base = level_override.unwrap_or(config.level.as_str());
    let filter = build_filter(base, &config.module_levels)?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.include_target)
            .with_ansi(false);
        registry.with(layer).try_init()?;
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(config.include_target)
            .with_ansi(config.ansi_colors);
        registry.with(layer).try_init()?;
    }

    tracing::info!(target: "portico_server", "Logging initialized with level: {}", base);
    Ok(())
}
