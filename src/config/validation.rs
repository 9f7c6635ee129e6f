//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses and the upstream URL
//! - Validate value ranges (timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::ProxyConfig;

const UPSTREAM_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

/// One semantic problem in a config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("upstream.target: invalid URL '{value}': {reason}")]
    InvalidTarget { value: String, reason: String },

    #[error("upstream.target: unsupported scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("{0}: must be greater than zero")]
    Zero(&'static str),
}

/// Check a parsed config, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(
        &mut errors,
        "listener.bind_address",
        &config.listener.bind_address,
    );

    match Url::parse(&config.upstream.target) {
        Ok(target) => {
            if !UPSTREAM_SCHEMES.contains(&target.scheme()) {
                errors.push(ValidationError::UnsupportedScheme(target.scheme().to_string()));
            }
            if target.host_str().map_or(true, str::is_empty) {
                errors.push(ValidationError::InvalidTarget {
                    value: config.upstream.target.clone(),
                    reason: "missing host".to_string(),
                });
            }
        }
        Err(err) => errors.push(ValidationError::InvalidTarget {
            value: config.upstream.target.clone(),
            reason: err.to_string(),
        }),
    }

    if config.upstream.connect_timeout_secs == 0 {
        errors.push(ValidationError::Zero("upstream.connect_timeout_secs"));
    }

    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
