//! Listener ownership: bind, serve, drain.
//!
//! # Responsibilities
//! - Bind the configured address in plaintext or TLS mode
//! - Provision certificates before a TLS bind
//! - Hand out one generation-numbered handle per live listener
//! - Drain in-flight requests on shutdown, then force-close
//!
//! # Design Decisions
//! - At most one handle is outstanding; a second `start` is refused
//! - The socket is bound before the serve task spawns, so bind errors
//!   surface from `start` instead of from a background task
//! - Shutdown never blocks past `drain + SHUTDOWN_GRACE`

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfigSnapshot;
use crate::http::RegisterHandlers;
use crate::net::tls::{install_crypto_provider, load_tls_config, CertError, CertificateProvisioner, Provisioned};

/// Time in-flight requests get to finish once a listener stops accepting.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time the serve task gets, after the drain, to wind down before it
/// is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Listener generation {generation} is still active")]
    AlreadyActive { generation: u64 },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS provisioning failed: {0}")]
    Provision(#[from] CertError),

    #[error("Listener generation {generation} did not close cleanly: {reason}")]
    Close { generation: u64, reason: String },
}

/// A live listener. Only [`ListenerManager`] can create or retire one.
#[derive(Debug)]
pub struct ListenerHandle {
    generation: u64,
    local_addr: SocketAddr,
    tls: bool,
    server: axum_server::Handle,
    task: JoinHandle<io::Result<()>>,
}

impl ListenerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Connections currently open on this listener.
    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }
}

/// Owns the single live listener.
pub struct ListenerManager {
    provisioner: Arc<dyn CertificateProvisioner>,
    next_generation: u64,
    outstanding: Option<u64>,
}

impl ListenerManager {
    pub fn new(provisioner: Arc<dyn CertificateProvisioner>) -> Self {
        install_crypto_provider();
        Self {
            provisioner,
            next_generation: 0,
            outstanding: None,
        }
    }

    /// Generation of the handle that has not been shut down yet, if any.
    pub fn active_generation(&self) -> Option<u64> {
        self.outstanding
    }

    /// Bind and serve a new listener for `snapshot`.
    ///
    /// Fails with [`ListenerError::AlreadyActive`] while a previous handle
    /// has not been passed to [`shutdown`](Self::shutdown).
    pub async fn start(
        &mut self,
        snapshot: &ServerConfigSnapshot,
        register: &RegisterHandlers,
    ) -> Result<ListenerHandle, ListenerError> {
        if let Some(generation) = self.outstanding {
            return Err(ListenerError::AlreadyActive { generation });
        }

        let tls_config = if snapshot.tls_enabled {
            Some(self.prepare_tls(snapshot).await?)
        } else {
            None
        };

        let address = snapshot.address();
        let bind_error = |source| ListenerError::Bind {
            address: address.clone(),
            source,
        };

        let listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let listener = listener.into_std().map_err(bind_error)?;

        let app = register(snapshot).into_make_service();
        let server = axum_server::Handle::new();
        let tls = tls_config.is_some();

        let mut task = match tls_config {
            Some(config) => tokio::spawn(
                axum_server::tls_rustls::from_tcp_rustls(listener, config)
                    .handle(server.clone())
                    .serve(app),
            ),
            None => tokio::spawn(
                axum_server::from_tcp(listener)
                    .handle(server.clone())
                    .serve(app),
            ),
        };

        // `listening` resolves to None if the serve task gave up before accepting.
        if server.listening().await.is_none() {
            let reason = match (&mut task).await {
                Ok(Ok(())) => io::Error::other("server exited before accepting"),
                Ok(Err(e)) => e,
                Err(e) => io::Error::other(e.to_string()),
            };
            return Err(bind_error(reason));
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.outstanding = Some(generation);

        tracing::info!(
            generation,
            address = %local_addr,
            tls,
            "Listener started"
        );

        Ok(ListenerHandle {
            generation,
            local_addr,
            tls,
            server,
            task,
        })
    }

    async fn prepare_tls(&self, snapshot: &ServerConfigSnapshot) -> Result<RustlsConfig, ListenerError> {
        let provisioner = Arc::clone(&self.provisioner);
        let cert_path = snapshot.cert_path.clone();
        let key_path = snapshot.key_path.clone();

        let provisioned = tokio::task::spawn_blocking(move || provisioner.provision(&cert_path, &key_path))
            .await
            .map_err(|e| CertError::Task(e.to_string()))??;

        if provisioned == Provisioned::Generated {
            tracing::warn!(cert = ?snapshot.cert_path, "Serving a freshly generated self-signed certificate");
        }

        Ok(load_tls_config(&snapshot.cert_path, &snapshot.key_path).await?)
    }

    /// Stop accepting, give in-flight requests `drain`, then force-close.
    ///
    /// Returns once the listener is gone, at most `drain + SHUTDOWN_GRACE`
    /// later. The only error is a serve task that failed or panicked, which
    /// callers should treat as a leak warning.
    pub async fn shutdown(&mut self, handle: ListenerHandle, drain: Duration) -> Result<(), ListenerError> {
        let ListenerHandle {
            generation,
            local_addr,
            server,
            mut task,
            ..
        } = handle;

        if self.outstanding == Some(generation) {
            self.outstanding = None;
        } else {
            tracing::warn!(generation, active = ?self.outstanding, "Shutting down a listener this manager does not track");
        }

        tracing::info!(
            generation,
            address = %local_addr,
            in_flight = server.connection_count(),
            drain_ms = drain.as_millis() as u64,
            "Listener draining"
        );
        server.graceful_shutdown(Some(drain));

        let outcome = match tokio::time::timeout(drain + SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ListenerError::Close {
                generation,
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(ListenerError::Close {
                generation,
                reason: e.to_string(),
            }),
            Err(_) => {
                tracing::warn!(generation, "Listener did not stop within the drain deadline, aborting");
                server.shutdown();
                task.abort();
                Ok(())
            }
        };

        let remaining = server.connection_count();
        if remaining > 0 {
            tracing::warn!(generation, remaining, "Connections force-closed after drain timeout");
        }
        tracing::info!(generation, "Listener stopped");

        outcome
    }
}
