//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "OVERLAY_LOG_LEVEL";

/// Environment variable overriding the registry URL
pub const ENV_REGISTRY_URL: &str = "OVERLAY_REGISTRY_URL";

/// Environment variable overriding the public host of relays and services
pub const ENV_PUBLIC_IP: &str = "OVERLAY_PUBLIC_IP";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        registry = %config.registry.url,
        log_level = %config.log.level,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `OVERLAY_LOG_LEVEL`: Override log level
/// - `OVERLAY_REGISTRY_URL`: Override registry URL
/// - `OVERLAY_PUBLIC_IP`: Override the public host of the relay and service roles
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails, or an override is empty.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply overrides from `lookup` (normally the process environment)
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for an empty override.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| -> Result<Option<String>, ConfigError> {
        match lookup(name) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::EnvError {
                name: name.into(),
                reason: "value is empty".into(),
            }),
            other => Ok(other.map(|v| v.trim().to_string())),
        }
    };

    if let Some(level) = non_empty(ENV_LOG_LEVEL)? {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(url) = non_empty(ENV_REGISTRY_URL)? {
        config.registry.url = url;
        debug!("Registry URL overridden to {}", config.registry.url);
    }

    if let Some(host) = non_empty(ENV_PUBLIC_IP)? {
        config.relay.public_host.clone_from(&host);
        config.service.public_host = host;
        debug!("Public host overridden to {}", config.relay.public_host);
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
