//! Debounced configuration change events.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::source::ChangeFeed;
use crate::lifecycle::events::LifecycleEvent;

/// Window in which repeated change notifications collapse into one event.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

const EVENT_QUEUE: usize = 16;

/// Collapses bursts of raw notifications.
///
/// The first notification of a burst opens a window of fixed length; every
/// notification that lands inside it is absorbed. The window is not
/// extended, so a file that is rewritten continuously still produces an
/// event every `window`.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Wait for the next burst and return how many notifications it held.
    ///
    /// Returns `None` if the feed ends before a burst starts. A feed that
    /// ends mid-burst still yields that burst.
    pub async fn next_burst(&self, feed: &mut ChangeFeed) -> Option<usize> {
        feed.recv().await?;
        let deadline = Instant::now() + self.window;
        let mut coalesced = 1;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Some(coalesced),
                next = feed.recv() => match next {
                    Some(()) => coalesced += 1,
                    None => return Some(coalesced),
                },
            }
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

/// Turns a raw [`ChangeFeed`] into [`LifecycleEvent::ConfigChanged`] events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigWatcher {
    debouncer: Debouncer,
}

impl ConfigWatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            debouncer: Debouncer::new(window),
        }
    }

    /// Spawn the watcher task.
    ///
    /// Events are emitted in the order their windows close. The task exits
    /// when the feed ends or the receiver is dropped.
    pub fn watch(self, mut feed: ChangeFeed) -> mpsc::Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);

        tokio::spawn(async move {
            while let Some(coalesced) = self.debouncer.next_burst(&mut feed).await {
                tracing::info!(coalesced, "Configuration change detected");
                if tx.send(LifecycleEvent::ConfigChanged).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Config watcher stopped");
        });

        rx
    }
}
