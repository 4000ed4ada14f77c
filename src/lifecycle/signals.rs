//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate the first one into a single `ShutdownRequested` event
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Handlers are installed before `listen` returns, so a signal raised
//!   right after the call is never lost to the default disposition
//! - Once installed, Tokio keeps the handlers for the life of the process;
//!   later signals are swallowed rather than queued, so shutdown is never
//!   re-entered

use tokio::sync::mpsc;

use crate::lifecycle::events::LifecycleEvent;

/// Install SIGINT/SIGTERM handlers and return a channel that yields exactly
/// one `ShutdownRequested`, after which it closes.
///
/// Must be called from within a Tokio runtime.
pub fn listen() -> mpsc::Receiver<LifecycleEvent> {
    let (tx, rx) = mpsc::channel(1);
    let mut signals = ShutdownSignals::register();

    tokio::spawn(async move {
        match signals.recv().await {
            Some(name) => {
                tracing::info!(signal = name, "Shutdown signal received");
                let _ = tx.send(LifecycleEvent::ShutdownRequested).await;
            }
            None => tracing::error!("No shutdown signal handler could be installed"),
        }
    });

    rx
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let install = |kind: SignalKind, name: &'static str| match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(signal = name, error = %e, "Failed to install signal handler");
                None
            }
        };

        Self {
            interrupt: install(SignalKind::interrupt(), "SIGINT"),
            terminate: install(SignalKind::terminate(), "SIGTERM"),
        }
    }

    async fn recv(&mut self) -> Option<&'static str> {
        async fn next(stream: &mut Option<tokio::signal::unix::Signal>) {
            match stream {
                Some(stream) => {
                    if stream.recv().await.is_none() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending().await,
            }
        }

        if self.interrupt.is_none() && self.terminate.is_none() {
            return None;
        }

        tokio::select! {
            _ = next(&mut self.interrupt) => Some("SIGINT"),
            _ = next(&mut self.terminate) => Some("SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> Self {
        Self
    }

    async fn recv(&mut self) -> Option<&'static str> {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some("ctrl-c"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                None
            }
        }
    }
}
