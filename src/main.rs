//! Packagelock server.
//!
//! # Architecture Overview
//!
//! ```text
//!     SIGTERM / SIGINT ──▶ lifecycle::signals ──┐
//!                                               ▼
//!     config.toml ──▶ config::source ──▶ config::watcher ──▶ lifecycle::controller
//!                     (notify)            (debounce)          │ one task, one listener
//!                                                             ▼
//!                                         net::tls (provision) ─▶ net::listener
//!                                                                 (axum-server)
//!                                                                     │
//!                                                                     ▼
//!                                                               http::routes
//! ```

use std::process::ExitCode;

use clap::Parser;

use packagelock::cli::{self, Cli};
use packagelock::config::loader::load_config;
use packagelock::config::schema::LoggingConfig;
use packagelock::observability::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging_config = load_config(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_else(|_| LoggingConfig::default());
    if let Err(e) = logging::init(&logging_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match cli::execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
