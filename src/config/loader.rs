//! Configuration loading

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
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
        groups = config.groups.len(),
        upstream = %config.target_dns_server_address,
        listen_port = config.listen_port,
        "configuration loaded"
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
/// - `ROUTEMARK_LISTEN_PORT`: Override the proxy listen port
/// - `ROUTEMARK_UPSTREAM`: Override the upstream resolver address
/// - `ROUTEMARK_LOG_LEVEL`: Override log level
/// - `ROUTEMARK_NOTIFY_SOCKET`: Override the notification socket path
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(port) = std::env::var("ROUTEMARK_LISTEN_PORT") {
        config.listen_port = port.parse().map_err(|_| ConfigError::EnvError {
            name: "ROUTEMARK_LISTEN_PORT".into(),
            reason: format!("invalid port: {port}"),
        })?;
        debug!("listen port overridden to {}", config.listen_port);
    }

    if let Ok(upstream) = std::env::var("ROUTEMARK_UPSTREAM") {
        config.target_dns_server_address = upstream;
        debug!(
            "upstream overridden to {}",
            config.target_dns_server_address
        );
    }

    if let Ok(level) = std::env::var("ROUTEMARK_LOG_LEVEL") {
        config.log.level = level;
        debug!("log level overridden to {}", config.log.level);
    }

    if let Ok(socket) = std::env::var("ROUTEMARK_NOTIFY_SOCKET") {
        config.notify_socket_path = socket.into();
        debug!(
            "notify socket overridden to {:?}",
            config.notify_socket_path
        );
    }

    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let config = Config::default_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_temp_config();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chain_prefix, "RTMK_");
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str() {
        let json = r#"{
            "target_dns_server_address": "1.1.1.1:53",
            "listen_port": 5353,
            "groups": [{
                "id": 1,
                "name": "vpn",
                "interface": "wg0",
                "rules": [{ "id": 1, "kind": "plaintext", "pattern": "example.com" }]
            }]
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.listen_port, 5353);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].rules.len(), 1);
    }

    #[test]
    fn test_load_config_invalid_json() {
        let result = load_config_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_create_default_config_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        create_default_config(&path).unwrap();
        load_config(&path).unwrap();
    }
}
