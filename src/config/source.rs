//! Sources of configuration snapshots and raw change notifications.
//!
//! The lifecycle controller never parses configuration itself. It asks a
//! [`ConfigSource`] for the latest [`ServerConfigSnapshot`] whenever it
//! needs one and subscribes once to its raw change feed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::ServerConfigSnapshot;

/// Produces configuration snapshots and notifies on change.
pub trait ConfigSource: Send + Sync + 'static {
    /// Read the current configuration. Always reflects the live state, never a cached event payload.
    fn snapshot(&self) -> Result<ServerConfigSnapshot, ConfigError>;

    /// Subscribe to raw, undebounced change notifications.
    fn changes(&self) -> Result<ChangeFeed, ConfigError>;
}

/// Stream of raw change notifications.
///
/// Holds whatever keeps the underlying watcher alive; dropping the feed
/// stops the notifications.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<()>,
    _watcher: Option<RecommendedWatcher>,
}

impl ChangeFeed {
    /// Wrap a plain receiver.
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<()>) -> Self {
        Self { rx, _watcher: None }
    }

    /// Wait for the next raw notification. `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// TOML file on disk, watched with `notify`.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn snapshot(&self) -> Result<ServerConfigSnapshot, ConfigError> {
        load_config(&self.path).map(|config| config.snapshot())
    }

    fn changes(&self) -> Result<ChangeFeed, ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch_error = |source| ConfigError::Watch {
            path: self.path.clone(),
            source,
        };

        // Editors often save by writing a temp file and renaming it over the
        // original, so watch the directory and match on the file name.
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(ToOwned::to_owned);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some() && p.file_name() == file_name.as_deref());
                    if ours && tx.send(()).is_err() {
                        tracing::debug!("Config change feed closed, dropping notification");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default(),
        )
        .map_err(watch_error)?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(ChangeFeed {
            rx,
            _watcher: Some(watcher),
        })
    }
}

/// In-memory source whose snapshot is replaced programmatically.
///
/// Used when embedding the server without a config file, and in tests.
pub struct MemoryConfigSource {
    current: ArcSwap<ServerConfigSnapshot>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl MemoryConfigSource {
    pub fn new(initial: ServerConfigSnapshot) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the snapshot and notify subscribers.
    pub fn set(&self, snapshot: ServerConfigSnapshot) {
        self.current.store(Arc::new(snapshot));
        self.touch();
    }

    /// Notify subscribers without changing the snapshot.
    pub fn touch(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(()).is_ok());
    }

    pub fn current(&self) -> ServerConfigSnapshot {
        self.current.load().as_ref().clone()
    }
}

impl ConfigSource for MemoryConfigSource {
    fn snapshot(&self) -> Result<ServerConfigSnapshot, ConfigError> {
        Ok(self.current())
    }

    fn changes(&self) -> Result<ChangeFeed, ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(ChangeFeed::from_receiver(rx))
    }
}
