//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_partial_config_with_defaults() {
        let file = write_config(
            r#"
            [upstream]
            target = "wss://echo.example.com/socket"

            [observability]
            json_logs = true
            "#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.upstream.target, "wss://echo.example.com/socket");
        assert_eq!(config.upstream.connect_timeout_secs, 10);
        assert!(config.observability.json_logs);
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.lifecycle.shutdown_grace_secs, 5);
    }

    #[test]
    fn empty_file_is_default() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.upstream.target, "http://127.0.0.1:9000");
    }

    #[test]
    fn reports_parse_errors() {
        let file = write_config("[upstream\ntarget = ");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn reports_validation_errors() {
        let file = write_config(
            r#"
            [listener]
            bind_address = "localhost"

            [upstream]
            connect_timeout_secs = 0
            "#,
        );

        match load_config(file.path()) {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
