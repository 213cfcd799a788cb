use std::path::Path;

use anyhow::{Context, Result};
use pylon_runtime::{load_runtime_config, RuntimeConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::CliOverrides;

/// Logs go to stderr; stdout carries the response stream.
pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Loads the config file (or defaults), applies flag overrides, and validates.
pub(crate) fn resolve_runtime_config(
    config_path: Option<&Path>,
    overrides: &CliOverrides,
) -> Result<RuntimeConfig> {
    let mut config = match config_path {
        Some(path) => load_runtime_config(path)
            .with_context(|| format!("failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    overrides.apply(&mut config);
    config
        .validate()
        .context("invalid runtime config after applying flags")?;
    Ok(config)
}
