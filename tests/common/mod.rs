//! Shared utilities for lifecycle integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use packagelock::config::{ConfigSource, ConfigWatcher, MemoryConfigSource, ServerConfigSnapshot};
use packagelock::http::{default_handlers, RegisterHandlers};
use packagelock::lifecycle::{
    Controller, ControllerOptions, EventSources, ExitStatus, LifecycleEvent, LifecycleState, StateChange,
};
use packagelock::net::SelfSignedProvisioner;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Upper bound for any single wait in these tests.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Drain bound used by test controllers.
pub const TEST_DRAIN: Duration = Duration::from_millis(200);

/// Plaintext snapshot on an ephemeral loopback port.
pub fn loopback() -> ServerConfigSnapshot {
    ServerConfigSnapshot::plaintext("127.0.0.1", 0)
}

/// A loopback port nobody is listening on right now.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// A controller running on its own task, driven through channels.
pub struct Harness {
    pub source: Arc<MemoryConfigSource>,
    pub shutdown: mpsc::Sender<LifecycleEvent>,
    pub states: broadcast::Receiver<StateChange>,
    pub pid_file: PathBuf,
    pub task: JoinHandle<ExitStatus>,
    pub dir: TempDir,
}

pub struct HarnessBuilder {
    snapshot: ServerConfigSnapshot,
    register: Arc<RegisterHandlers>,
    debounce: Duration,
    source: Option<Arc<dyn ConfigSource>>,
    dir: TempDir,
}

impl HarnessBuilder {
    pub fn new(snapshot: ServerConfigSnapshot) -> Self {
        Self {
            snapshot,
            register: Arc::new(default_handlers),
            debounce: Duration::from_millis(100),
            source: None,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn register(mut self, register: Arc<RegisterHandlers>) -> Self {
        self.register = register;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    /// Serve the controller from `source` instead of the harness' memory source.
    /// Changes are still fed from the memory source.
    pub fn source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn memory_source(&self) -> Arc<MemoryConfigSource> {
        MemoryConfigSource::new(self.snapshot.clone())
    }

    pub fn spawn(self) -> Harness {
        self.spawn_with(None)
    }

    /// Spawn with an explicit memory source, so a custom `source` can share it.
    pub fn spawn_with(self, memory: Option<Arc<MemoryConfigSource>>) -> Harness {
        let memory = memory.unwrap_or_else(|| MemoryConfigSource::new(self.snapshot.clone()));
        let pid_file = self.dir.path().join("packagelock.pid");

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let feed = memory.changes().unwrap();
        let config_rx = ConfigWatcher::new(self.debounce).watch(feed);

        let source: Arc<dyn ConfigSource> = match self.source {
            Some(source) => source,
            None => memory.clone() as Arc<dyn ConfigSource>,
        };
        let controller = Controller::new(
            source,
            Arc::new(SelfSignedProvisioner::default()),
            self.register,
            ControllerOptions {
                pid_file: pid_file.clone(),
                drain_timeout: TEST_DRAIN,
                debounce_window: self.debounce,
            },
        );
        let states = controller.subscribe();
        let task = tokio::spawn(controller.run_with(EventSources::new(shutdown_rx, Some(config_rx))));

        Harness {
            source: memory,
            shutdown,
            states,
            pid_file,
            task,
            dir: self.dir,
        }
    }
}

impl Harness {
    pub fn spawn(snapshot: ServerConfigSnapshot) -> Self {
        HarnessBuilder::new(snapshot).spawn()
    }

    /// Next published state change.
    pub async fn next_state(&mut self) -> StateChange {
        tokio::time::timeout(PATIENCE, self.states.recv())
            .await
            .expect("timed out waiting for a state change")
            .expect("state channel closed")
    }

    /// Skip ahead to the next entry into `state`.
    pub async fn wait_for(&mut self, state: LifecycleState) -> StateChange {
        loop {
            let change = self.next_state().await;
            if change.state == state {
                return change;
            }
        }
    }

    /// Request shutdown and wait for the controller to finish.
    ///
    /// Returns the exit status and the state changes not yet received.
    pub async fn stop(&mut self) -> (ExitStatus, Vec<StateChange>) {
        let _ = self.shutdown.send(LifecycleEvent::ShutdownRequested).await;
        let status = tokio::time::timeout(PATIENCE, &mut self.task)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked");

        (status, drain_states(&mut self.states))
    }
}

/// Everything still buffered in `states`.
pub fn drain_states(states: &mut broadcast::Receiver<StateChange>) -> Vec<StateChange> {
    let mut seen = Vec::new();
    while let Ok(change) = states.try_recv() {
        seen.push(change);
    }
    seen
}

pub fn count(states: &[StateChange], state: LifecycleState) -> usize {
    states.iter().filter(|c| c.state == state).count()
}

/// HTTP client that accepts the self-signed certificates the server generates.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}
