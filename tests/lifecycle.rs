//! End-to-end controller scenarios.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use packagelock::config::{ChangeFeed, ConfigError, ConfigSource, MemoryConfigSource, ServerConfigSnapshot};
use packagelock::http::{default_handlers, RegisterHandlers};
use packagelock::lifecycle::{
    Controller, ControllerOptions, EventSources, ExitStatus, FatalError, LifecycleEvent, LifecycleState,
};
use packagelock::net::SelfSignedProvisioner;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

mod common;
use common::{client, count, drain_states, free_port, loopback, Harness, HarnessBuilder, PATIENCE, TEST_DRAIN};

#[tokio::test]
async fn plaintext_start_and_shutdown() {
    let mut harness = Harness::spawn(loopback());

    assert_eq!(harness.next_state().await.state, LifecycleState::Starting);
    let running = harness.next_state().await;
    assert_eq!(running.state, LifecycleState::Running);
    assert_eq!(running.generation, Some(0));
    let addr = running.local_addr.unwrap();

    let pid = std::fs::read_to_string(&harness.pid_file).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    let res = client().get(format!("http://{addr}/livez")).send().await.unwrap();
    assert_eq!(res.status(), 200);

    let (status, states) = harness.stop().await;

    assert!(status.is_clean());
    assert_eq!(status.code(), 0);
    assert!(!harness.pid_file.exists());
    assert!(TcpStream::connect(addr).await.is_err());

    let order: Vec<_> = states.iter().map(|c| c.state).collect();
    assert_eq!(order, vec![LifecycleState::ShuttingDown, LifecycleState::Stopped]);
}

#[tokio::test]
async fn tls_start_generates_missing_certificates() {
    let builder = HarnessBuilder::new(loopback());
    let cert = builder.dir().join("certs").join("server.crt");
    let key = builder.dir().join("certs").join("server.key");
    assert!(!cert.exists() && !key.exists());

    let mut snapshot = loopback();
    snapshot.tls_enabled = true;
    snapshot.cert_path = cert.clone();
    snapshot.key_path = key.clone();

    let memory = MemoryConfigSource::new(snapshot);
    let mut harness = builder.spawn_with(Some(memory));

    let running = harness.wait_for(LifecycleState::Running).await;
    let addr = running.local_addr.unwrap();
    assert!(cert.exists() && key.exists());

    let res = client()
        .get(format!("https://127.0.0.1:{}/v1/general/status", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "operational");

    let pid = std::fs::read_to_string(&harness.pid_file).unwrap();
    assert_eq!(pid.trim().parse::<u32>().unwrap(), std::process::id());

    let (status, _) = harness.stop().await;
    assert!(status.is_clean());
}

#[tokio::test]
async fn port_change_restarts_once_with_next_generation() {
    let mut harness = Harness::spawn(loopback());
    let first = harness.wait_for(LifecycleState::Running).await;
    let old_addr = first.local_addr.unwrap();

    let new_port = free_port();
    harness
        .source
        .set(ServerConfigSnapshot::plaintext("127.0.0.1", new_port));

    assert_eq!(harness.next_state().await.state, LifecycleState::Restarting);
    let second = harness.next_state().await;
    assert_eq!(second.state, LifecycleState::Running);
    assert_eq!(second.generation, Some(1));
    assert_eq!(second.local_addr.unwrap().port(), new_port);

    // Only the new listener accepts.
    assert!(TcpStream::connect(old_addr).await.is_err());
    let res = client()
        .get(format!("http://127.0.0.1:{new_port}/readyz"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let (status, rest) = harness.stop().await;
    assert!(status.is_clean());
    assert_eq!(count(&rest, LifecycleState::Restarting), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_during_restart_is_queued() {
    // The first rebuild is slow, so the next change lands mid-restart.
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let register: Arc<RegisterHandlers> = Arc::new(move |snapshot: &ServerConfigSnapshot| {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
            std::thread::sleep(Duration::from_millis(500));
        }
        default_handlers(snapshot)
    });
    let mut harness = HarnessBuilder::new(loopback()).register(register).spawn();
    assert_eq!(harness.wait_for(LifecycleState::Running).await.generation, Some(0));

    harness.source.set(ServerConfigSnapshot::plaintext("127.0.0.1", free_port()));
    assert_eq!(harness.next_state().await.state, LifecycleState::Restarting);

    let final_port = free_port();
    harness
        .source
        .set(ServerConfigSnapshot::plaintext("127.0.0.1", final_port));

    let first = harness.next_state().await;
    assert_eq!((first.state, first.generation), (LifecycleState::Running, Some(1)));
    assert_eq!(harness.next_state().await.state, LifecycleState::Restarting);
    let second = harness.next_state().await;
    assert_eq!((second.state, second.generation), (LifecycleState::Running, Some(2)));
    assert_eq!(second.local_addr.unwrap().port(), final_port);

    let (status, rest) = harness.stop().await;
    assert!(status.is_clean());
    assert_eq!(count(&rest, LifecycleState::Restarting), 0);
    assert_eq!(builds.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn burst_of_changes_restarts_once() {
    let mut harness = HarnessBuilder::new(loopback())
        .debounce(Duration::from_millis(500))
        .spawn();
    harness.wait_for(LifecycleState::Running).await;

    for _ in 0..3 {
        harness.source.touch();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let restarted = harness.wait_for(LifecycleState::Running).await;
    assert_eq!(restarted.generation, Some(1));

    // Nothing else is coming from that burst.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let (status, rest) = harness.stop().await;
    assert!(status.is_clean());
    assert_eq!(count(&rest, LifecycleState::Restarting), 0);
}

#[tokio::test]
async fn shutdown_wins_over_pending_change() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("packagelock.pid");

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (config_tx, config_rx) = mpsc::channel(4);
    config_tx.send(LifecycleEvent::ConfigChanged).await.unwrap();
    shutdown_tx.send(LifecycleEvent::ShutdownRequested).await.unwrap();

    let controller = Controller::new(
        MemoryConfigSource::new(loopback()),
        Arc::new(SelfSignedProvisioner::default()),
        Arc::new(packagelock::http::default_handlers),
        ControllerOptions {
            pid_file: pid_file.clone(),
            drain_timeout: TEST_DRAIN,
            ..ControllerOptions::default()
        },
    );
    let mut states = controller.subscribe();

    let status = tokio::time::timeout(
        PATIENCE,
        controller.run_with(EventSources::new(shutdown_rx, Some(config_rx))),
    )
    .await
    .unwrap();
    assert!(status.is_clean());

    let seen: Vec<_> = drain_states(&mut states).into_iter().map(|c| c.state).collect();
    assert_eq!(
        seen,
        vec![
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::ShuttingDown,
            LifecycleState::Stopped,
        ]
    );
    assert!(!pid_file.exists());
    drop(config_tx);
}

#[tokio::test]
async fn stopped_is_published_exactly_once() {
    let mut harness = Harness::spawn(loopback());
    harness.wait_for(LifecycleState::Running).await;
    let mut extra = harness.states.resubscribe();

    // Redundant requests after the first are ignored.
    let shutdown = harness.shutdown.clone();
    let (status, states) = harness.stop().await;
    let _ = shutdown.try_send(LifecycleEvent::ShutdownRequested);

    assert!(status.is_clean());
    assert_eq!(count(&states, LifecycleState::Stopped), 1);
    assert_eq!(states.last().map(|c| c.state), Some(LifecycleState::Stopped));

    let later = drain_states(&mut extra);
    assert_eq!(count(&later, LifecycleState::Stopped), 1);
    assert!(matches!(
        extra.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Closed)
    ));
}

#[tokio::test]
async fn bind_failure_is_fatal_and_releases_pid_file() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let harness = Harness::spawn(ServerConfigSnapshot::plaintext("127.0.0.1", port));
    let status = tokio::time::timeout(PATIENCE, harness.task).await.unwrap().unwrap();
    assert_eq!(status.code(), 1);
    match &status {
        ExitStatus::Fatal(fatal) => {
            assert!(matches!(fatal, FatalError::Bind(_)));
            assert_eq!(fatal.operation(), "bind");
        }
        other => panic!("expected a bind failure, got {other:?}"),
    }
    assert!(!harness.pid_file.exists());
    drop(taken);
}

#[tokio::test]
async fn restart_on_taken_port_is_fatal() {
    let mut harness = Harness::spawn(loopback());
    harness.wait_for(LifecycleState::Running).await;

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    harness
        .source
        .set(ServerConfigSnapshot::plaintext("127.0.0.1", port));

    let status = tokio::time::timeout(PATIENCE, harness.task).await.unwrap().unwrap();
    match &status {
        ExitStatus::Fatal(fatal) => assert_eq!(fatal.operation(), "re-bind"),
        other => panic!("expected a re-bind failure, got {other:?}"),
    }
    assert!(!harness.pid_file.exists());
    drop(taken);
}

/// Serves the memory snapshot until told to fail.
struct FlakySource {
    inner: Arc<MemoryConfigSource>,
    failing: AtomicBool,
}

impl ConfigSource for FlakySource {
    fn snapshot(&self) -> Result<ServerConfigSnapshot, ConfigError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConfigError::Io {
                path: "config.toml".into(),
                source: std::io::Error::other("disk on fire"),
            });
        }
        self.inner.snapshot()
    }

    fn changes(&self) -> Result<ChangeFeed, ConfigError> {
        self.inner.changes()
    }
}

#[tokio::test]
async fn unreadable_config_keeps_current_listener() {
    let builder = HarnessBuilder::new(loopback());
    let memory = builder.memory_source();
    let flaky = Arc::new(FlakySource {
        inner: memory.clone(),
        failing: AtomicBool::new(false),
    });

    let mut harness = builder.source(flaky.clone()).spawn_with(Some(memory));
    let running = harness.wait_for(LifecycleState::Running).await;
    let addr = running.local_addr.unwrap();

    flaky.failing.store(true, Ordering::SeqCst);
    harness.source.touch();

    assert_eq!(harness.next_state().await.state, LifecycleState::Restarting);
    let still = harness.next_state().await;
    assert_eq!(still.state, LifecycleState::Running);
    assert_eq!(still.generation, Some(0));
    assert_eq!(still.local_addr, Some(addr));

    let res = client().get(format!("http://{addr}/livez")).send().await.unwrap();
    assert_eq!(res.status(), 200);

    let (status, _) = harness.stop().await;
    assert!(status.is_clean());
}

#[tokio::test]
async fn shutdown_is_bounded_by_drain_timeout() {
    let register: Arc<RegisterHandlers> = Arc::new(|_: &ServerConfigSnapshot| {
        Router::new().route("/hang", get(|| std::future::pending::<&'static str>()))
    });
    let mut harness = HarnessBuilder::new(loopback()).register(register).spawn();
    let addr = harness.wait_for(LifecycleState::Running).await.local_addr.unwrap();

    let in_flight = tokio::spawn(async move { client().get(format!("http://{addr}/hang")).send().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let (status, _) = harness.stop().await;
    let elapsed = started.elapsed();

    assert!(status.is_clean());
    // drain + one second of grace, plus scheduling slack
    assert!(elapsed < TEST_DRAIN + Duration::from_secs(2), "shutdown took {elapsed:?}");
    assert!(in_flight.await.unwrap().is_err());
}

#[tokio::test]
async fn closed_event_sources_shut_down() {
    let dir = tempfile::tempdir().unwrap();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    drop(shutdown_tx);

    let controller = Controller::new(
        MemoryConfigSource::new(loopback()),
        Arc::new(SelfSignedProvisioner::default()),
        Arc::new(packagelock::http::default_handlers),
        ControllerOptions {
            pid_file: dir.path().join("packagelock.pid"),
            drain_timeout: TEST_DRAIN,
            ..ControllerOptions::default()
        },
    );

    let status = tokio::time::timeout(PATIENCE, controller.run_with(EventSources::new(shutdown_rx, None)))
        .await
        .unwrap();
    assert!(status.is_clean());
    assert!(!dir.path().join("packagelock.pid").exists());
}
