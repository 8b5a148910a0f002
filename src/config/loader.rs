//! Configuration loading and management
//!
//! Loads JSON configuration from disk with optional environment variable
//! overrides, validating before returning.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or
/// validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse JSON: {e} at {path:?}")))?;
    config.validate()?;

    info!(
        listen = %config.listen_addr,
        peers = config.peers.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Load configuration from a JSON string.
///
/// # Errors
///
/// Returns [`ConfigError`] if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with environment variable overrides.
///
/// Environment variables:
/// - `RUST_TUNNEL_LISTEN_ADDR`: override listen address
/// - `RUST_TUNNEL_LOG_LEVEL`: override log level
/// - `RUST_TUNNEL_PRIVATE_KEY`: override the private key (useful for
///   keeping secrets out of config files)
///
/// # Errors
///
/// Returns [`ConfigError`] if loading fails or an override is malformed.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("RUST_TUNNEL_LISTEN_ADDR") {
        config.listen_addr = addr.parse().map_err(|e| ConfigError::EnvError {
            name: "RUST_TUNNEL_LISTEN_ADDR".into(),
            reason: format!("{e}"),
        })?;
        debug!("listen address overridden from environment");
    }

    if let Ok(level) = std::env::var("RUST_TUNNEL_LOG_LEVEL") {
        config.log.level = level;
    }

    if let Ok(key) = std::env::var("RUST_TUNNEL_PRIVATE_KEY") {
        config.private_key = key;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/rust-tunnel.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_config_str_valid() {
        let json = serde_json::to_string(&Config::example()).unwrap();
        let config = load_config_str(&json).unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_load_config_str_invalid_json() {
        assert!(matches!(
            load_config_str("{ not json"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_config_str_fails_validation() {
        let mut config = Config::example();
        config.peers.clear();
        let json = serde_json::to_string(&config).unwrap();
        assert!(matches!(
            load_config_str(&json),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
