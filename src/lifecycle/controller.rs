//! The process lifecycle state machine.
//!
//! ```text
//!            ┌──────────┐  ok   ┌─────────┐ ConfigChanged ┌────────────┐
//!   start ──▶│ Starting │──────▶│ Running │──────────────▶│ Restarting │
//!            └────┬─────┘       └────┬────┘◀──────────────└─────┬──────┘
//!                 │ fatal            │ ShutdownRequested   ok   │ fatal
//!                 │                  ▼                          │
//!                 │           ┌──────────────┐                  │
//!                 │           │ ShuttingDown │                  │
//!                 │           └──────┬───────┘                  │
//!                 ▼                  ▼                          ▼
//!            ┌──────────────────────────────────────────────────────┐
//!            │                        Stopped                       │
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition runs on the one task that called [`Controller::run`].
//! That task is the only writer of the active listener and of the PID file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ConfigError, ConfigSource, ConfigWatcher, ServerConfigSnapshot, DEBOUNCE_WINDOW};
use crate::http::RegisterHandlers;
use crate::lifecycle::events::{EventSources, LifecycleEvent};
use crate::lifecycle::pidfile::{PidFile, PidFileError, DEFAULT_PID_FILE};
use crate::lifecycle::signals;
use crate::net::{CertError, CertificateProvisioner, ListenerError, ListenerHandle, ListenerManager, DRAIN_TIMEOUT};

const STATE_CHANGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Restarting,
    ShuttingDown,
    Stopped,
}

/// Published on every state entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: LifecycleState,
    /// Generation of the live listener, if one is up.
    pub generation: Option<u64>,
    pub local_addr: Option<SocketAddr>,
}

/// Why the controller stopped with a non-zero exit.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("could not write PID file: {0}")]
    PidFile(#[source] PidFileError),

    #[error("could not read configuration: {0}")]
    ConfigRead(#[source] ConfigError),

    #[error("could not provision TLS certificate: {0}")]
    Provision(#[source] CertError),

    #[error("could not bind listener: {0}")]
    Bind(#[source] ListenerError),

    #[error("could not re-bind listener after configuration change: {0}")]
    Rebind(#[source] ListenerError),
}

impl FatalError {
    /// Name of the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            FatalError::PidFile(_) => "pid-file",
            FatalError::ConfigRead(_) => "config-read",
            FatalError::Provision(_) => "cert-provisioning",
            FatalError::Bind(_) => "bind",
            FatalError::Rebind(_) => "re-bind",
        }
    }

    fn from_start(err: ListenerError) -> Self {
        match err {
            ListenerError::Provision(e) => FatalError::Provision(e),
            other => FatalError::Bind(other),
        }
    }

    fn from_restart(err: ListenerError) -> Self {
        match err {
            ListenerError::Provision(e) => FatalError::Provision(e),
            other => FatalError::Rebind(other),
        }
    }
}

/// Terminal outcome of [`Controller::run`].
#[derive(Debug)]
pub enum ExitStatus {
    /// Stopped after a shutdown request.
    Clean,
    /// Stopped because of a fatal startup or restart failure.
    Fatal(FatalError),
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Fatal(_) => 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitStatus::Clean)
    }
}

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub pid_file: PathBuf,
    /// Drain bound for every listener shutdown, restart or final.
    pub drain_timeout: Duration,
    pub debounce_window: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            drain_timeout: DRAIN_TIMEOUT,
            debounce_window: DEBOUNCE_WINDOW,
        }
    }
}

/// Keeps exactly one listener alive across signals and config edits.
pub struct Controller {
    source: Arc<dyn ConfigSource>,
    listeners: ListenerManager,
    register: Arc<RegisterHandlers>,
    options: ControllerOptions,
    active: Option<ListenerHandle>,
    snapshot: Option<ServerConfigSnapshot>,
    pid_acquired: bool,
    changes: broadcast::Sender<StateChange>,
}

impl Controller {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        provisioner: Arc<dyn CertificateProvisioner>,
        register: Arc<RegisterHandlers>,
        options: ControllerOptions,
    ) -> Self {
        let (changes, _) = broadcast::channel(STATE_CHANGES);
        Self {
            source,
            listeners: ListenerManager::new(provisioner),
            register,
            options,
            active: None,
            snapshot: None,
            pid_acquired: false,
            changes,
        }
    }

    /// Subscribe to state entries. Subscribe before calling `run`.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Run until stopped, driven by OS signals and config file changes.
    pub async fn run(self) -> ExitStatus {
        let shutdown = signals::listen();
        let config = match self.source.changes() {
            Ok(feed) => Some(ConfigWatcher::new(self.options.debounce_window).watch(feed)),
            Err(e) => {
                tracing::warn!(error = %e, "Configuration changes will not be picked up");
                None
            }
        };

        self.run_with(EventSources::new(shutdown, config)).await
    }

    /// Run until stopped, driven by the given event sources.
    ///
    /// Consumes the controller, so `Stopped` is reached exactly once.
    pub async fn run_with(mut self, mut events: EventSources) -> ExitStatus {
        let mut state = LifecycleState::Starting;

        let outcome = loop {
            if state == LifecycleState::Stopped {
                break Ok(());
            }
            self.publish(state);

            let next = match state {
                LifecycleState::Starting => self.starting().await,
                LifecycleState::Running => Ok(self.running(&mut events).await),
                LifecycleState::Restarting => self.restarting().await,
                LifecycleState::ShuttingDown => Ok(self.shutting_down().await),
                LifecycleState::Stopped => Ok(LifecycleState::Stopped),
            };

            match next {
                Ok(next) => state = next,
                Err(fatal) => break Err(fatal),
            }
        };

        self.stopped(outcome).await
    }

    async fn starting(&mut self) -> Result<LifecycleState, FatalError> {
        PidFile::acquire(&self.options.pid_file).map_err(FatalError::PidFile)?;
        self.pid_acquired = true;

        let snapshot = self.source.snapshot().map_err(FatalError::ConfigRead)?;
        tracing::info!(
            address = %snapshot.address(),
            tls = snapshot.tls_enabled,
            production = snapshot.production,
            "Starting server"
        );

        let handle = self
            .listeners
            .start(&snapshot, self.register.as_ref())
            .await
            .map_err(FatalError::from_start)?;

        self.active = Some(handle);
        self.snapshot = Some(snapshot);
        Ok(LifecycleState::Running)
    }

    async fn running(&mut self, events: &mut EventSources) -> LifecycleState {
        match events.next().await {
            Some(LifecycleEvent::ShutdownRequested) => LifecycleState::ShuttingDown,
            Some(LifecycleEvent::ConfigChanged) => LifecycleState::Restarting,
            None => {
                tracing::warn!("All lifecycle event sources closed, shutting down");
                LifecycleState::ShuttingDown
            }
        }
    }

    async fn restarting(&mut self) -> Result<LifecycleState, FatalError> {
        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config. Keeping current listener.");
                return Ok(LifecycleState::Running);
            }
        };

        if let Some(previous) = &self.snapshot {
            if previous.address() != snapshot.address() || previous.tls_enabled != snapshot.tls_enabled {
                tracing::info!(
                    from = %previous.address(),
                    to = %snapshot.address(),
                    tls = snapshot.tls_enabled,
                    "Listener settings changed"
                );
            }
        }

        self.retire_active().await;

        let handle = self
            .listeners
            .start(&snapshot, self.register.as_ref())
            .await
            .map_err(FatalError::from_restart)?;

        tracing::info!(generation = handle.generation(), tls = handle.is_tls(), "Restart complete");
        self.active = Some(handle);
        self.snapshot = Some(snapshot);
        Ok(LifecycleState::Running)
    }

    async fn shutting_down(&mut self) -> LifecycleState {
        tracing::info!("Shutting down server");
        self.retire_active().await;
        self.release_pid_file();
        LifecycleState::Stopped
    }

    async fn stopped(mut self, outcome: Result<(), FatalError>) -> ExitStatus {
        let status = match outcome {
            Ok(()) => ExitStatus::Clean,
            Err(fatal) => {
                tracing::error!(operation = fatal.operation(), error = %fatal, "Fatal lifecycle error");
                self.retire_active().await;
                self.release_pid_file();
                ExitStatus::Fatal(fatal)
            }
        };

        self.publish(LifecycleState::Stopped);
        tracing::info!(exit_code = status.code(), "Server stopped");
        status
    }

    /// Shut the active listener down, if any. Failures are logged, never fatal.
    async fn retire_active(&mut self) {
        if let Some(handle) = self.active.take() {
            if let Err(e) = self.listeners.shutdown(handle, self.options.drain_timeout).await {
                tracing::warn!(error = %e, "Listener resources may have leaked");
            }
        }
    }

    fn release_pid_file(&mut self) {
        if !self.pid_acquired {
            return;
        }
        self.pid_acquired = false;
        if let Err(e) = PidFile::release(&self.options.pid_file) {
            tracing::warn!(error = %e, "Could not remove PID file");
        }
    }

    fn publish(&self, state: LifecycleState) {
        let change = StateChange {
            state,
            generation: self.active.as_ref().map(ListenerHandle::generation),
            local_addr: self.active.as_ref().map(ListenerHandle::local_addr),
        };
        tracing::debug!(?state, generation = ?change.generation, "Lifecycle state");
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}
