/// Configuration loading: TOML file layered with `DEPTHLOG__*` environment overrides
use ::config::{Config as ConfigSource, Environment, File};
use std::path::Path;
use tracing::debug;

use crate::error::{CollectorError, Result};
use crate::types::{Config, StorageBackend};

/// Environment override prefix, e.g. `DEPTHLOG__STORAGE__BUCKET`
pub const ENV_PREFIX: &str = "DEPTHLOG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CollectorError::ConfigError(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let config: Config = ConfigSource::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;

    validate_config(&config)?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Sampling
    if config.interval_seconds == 0 {
        return Err(CollectorError::ConfigError("interval_seconds must be > 0".to_string()));
    }
    if config.spread_layers.len() != 3 {
        return Err(CollectorError::ConfigError(format!(
            "spread_layers must have exactly 3 entries, got {}",
            config.spread_layers.len()
        )));
    }
    if config.spread_layers.iter().any(|&n| n == 0) || config.volume_layer == 0 {
        return Err(CollectorError::ConfigError("layer sizes must be >= 1".to_string()));
    }

    // Publishing
    if config.publish_1min_minutes == 0 || config.publish_5s_minutes == 0 {
        return Err(CollectorError::ConfigError("publish intervals must be > 0".to_string()));
    }

    // Orchestration
    if config.max_concurrency == 0 {
        return Err(CollectorError::ConfigError("max_concurrency must be > 0".to_string()));
    }
    if config.task_timeout_seconds == 0 {
        return Err(CollectorError::ConfigError("task_timeout_seconds must be > 0".to_string()));
    }
    if config.fetch_retry.max_attempts == 0 {
        return Err(CollectorError::ConfigError("fetch_retry.max_attempts must be >= 1".to_string()));
    }

    // Sources
    if config.enabled_venues().next().is_none() {
        return Err(CollectorError::ConfigError("no enabled venues configured".to_string()));
    }
    if config.instruments.is_empty() {
        return Err(CollectorError::ConfigError("instruments is empty".to_string()));
    }

    // Storage
    if config.storage.max_compose_sources < 2 {
        return Err(CollectorError::ConfigError(format!(
            "storage.max_compose_sources must be >= 2, got {}",
            config.storage.max_compose_sources
        )));
    }
    if config.storage.backend == StorageBackend::Gcs
        && config.storage.bucket.as_deref().map_or(true, str::is_empty)
    {
        return Err(CollectorError::ConfigError("storage.bucket is required for the gcs backend".to_string()));
    }

    Ok(())
}
