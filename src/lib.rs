//! Packagelock server lifecycle library.

pub mod cli;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::{AppConfig, ServerConfigSnapshot};
pub use lifecycle::{Controller, ControllerOptions, ExitStatus};
