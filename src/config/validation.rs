//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate TLS material paths when TLS is enabled
//! - Validate the logging level before the subscriber sees it
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::AppConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted key of the offending field (e.g., "network.host").
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.network.host.trim().is_empty() {
        errors.push(ValidationError::new("network.host", "must not be empty"));
    }

    if config.network.tls {
        if config.network.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "network.cert_path",
                "required when TLS is enabled",
            ));
        }
        if config.network.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "network.key_path",
                "required when TLS is enabled",
            ));
        }
        if !config.network.cert_path.as_os_str().is_empty()
            && config.network.cert_path == config.network.key_path
        {
            errors.push(ValidationError::new(
                "network.key_path",
                "must differ from network.cert_path",
            ));
        }
    }

    if config.lifecycle.pid_file.as_os_str().is_empty() {
        errors.push(ValidationError::new("lifecycle.pid_file", "must not be empty"));
    }

    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::new(
            "logging.level",
            format!("unknown level {:?}, expected one of {:?}", config.logging.level, LOG_LEVELS),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
