//! Lifecycle events and the merged stream the controller consumes.

use std::future;

use tokio::sync::mpsc;

/// Trigger for a controller transition.
///
/// Events carry no payload. On `ConfigChanged` the controller re-reads the
/// configuration source instead of trusting whatever was current when the
/// event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConfigChanged,
    ShutdownRequested,
}

/// Shutdown and configuration event channels, merged with shutdown first.
///
/// When both channels have an event ready, the shutdown channel always wins,
/// so a pending restart is never taken once shutdown has been requested.
pub struct EventSources {
    shutdown: Option<mpsc::Receiver<LifecycleEvent>>,
    config: Option<mpsc::Receiver<LifecycleEvent>>,
}

impl EventSources {
    pub fn new(
        shutdown: mpsc::Receiver<LifecycleEvent>,
        config: Option<mpsc::Receiver<LifecycleEvent>>,
    ) -> Self {
        Self {
            shutdown: Some(shutdown),
            config,
        }
    }

    /// Next event in arrival order, shutdown first on ties.
    ///
    /// Returns `None` once every source has closed.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        enum Polled {
            Shutdown(Option<LifecycleEvent>),
            Config(Option<LifecycleEvent>),
        }

        loop {
            if self.shutdown.is_none() && self.config.is_none() {
                return None;
            }

            let polled = tokio::select! {
                biased;
                event = recv_or_pending(&mut self.shutdown) => Polled::Shutdown(event),
                event = recv_or_pending(&mut self.config) => Polled::Config(event),
            };

            match polled {
                Polled::Shutdown(Some(event)) | Polled::Config(Some(event)) => return Some(event),
                Polled::Shutdown(None) => {
                    tracing::debug!("Shutdown event source closed");
                    self.shutdown = None;
                }
                Polled::Config(None) => {
                    tracing::debug!("Config event source closed");
                    self.config = None;
                }
            }
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<LifecycleEvent>>) -> Option<LifecycleEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
