//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the packagelock server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// General application settings.
    pub general: GeneralConfig,

    /// Listener configuration (address, TLS).
    pub network: NetworkConfig,

    /// Process lifecycle settings.
    pub lifecycle: LifecycleConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Extract the listener-relevant view of this configuration.
    pub fn snapshot(&self) -> ServerConfigSnapshot {
        ServerConfigSnapshot {
            host: self.network.host.clone(),
            port: self.network.port,
            tls_enabled: self.network.tls,
            cert_path: self.network.cert_path.clone(),
            key_path: self.network.key_path.clone(),
            production: self.general.production,
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Production mode. Forwarded to the handler layer, which enforces auth.
    pub production: bool,
}

/// Network listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host or IP to bind (e.g., "0.0.0.0").
    pub host: String,

    /// TCP port to bind.
    pub port: u16,

    /// Serve HTTPS instead of plain HTTP.
    pub tls: bool,

    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: true,
            cert_path: PathBuf::from("./certs/testing.crt"),
            key_path: PathBuf::from("./certs/testing.key"),
        }
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Where the running process records its PID.
    pub pid_file: PathBuf,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(crate::lifecycle::pidfile::DEFAULT_PID_FILE),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    pub level: String,

    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Immutable view of the settings the listener is built from.
///
/// The controller never mutates a snapshot; a config change produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfigSnapshot {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub production: bool,
}

impl ServerConfigSnapshot {
    /// Plaintext snapshot bound to `host:port`, mostly useful for tests and embedding.
    pub fn plaintext(host: impl Into<String>, port: u16) -> Self {
        let defaults = NetworkConfig::default();
        Self {
            host: host.into(),
            port,
            tls_enabled: false,
            cert_path: defaults.cert_path,
            key_path: defaults.key_path,
            production: false,
        }
    }

    /// Listen address as `host:port`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerConfigSnapshot {
    fn default() -> Self {
        AppConfig::default().snapshot()
    }
}
