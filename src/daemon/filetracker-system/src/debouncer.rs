//! Per-path debouncing
//!
//! Each path owns an independent timer. Re-arming a path cancels only that
//! path's timer; a burst on one file never delays another. When a timer
//! survives its quiet period the path is sent once on the expiry channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

pub struct Debouncer {
    quiet: Duration,
    timers: Arc<DashMap<PathBuf, Timer>>,
    next_generation: AtomicU64,
    expired: mpsc::UnboundedSender<PathBuf>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its expired paths are sent to.
    ///
    /// Must be armed from inside a tokio runtime.
    pub fn new(quiet: Duration) -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (expired, receiver) = mpsc::unbounded_channel();
        let debouncer = Self {
            quiet,
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            expired,
        };
        (debouncer, receiver)
    }

    /// Arm or re-arm the timer for `path`
    pub fn notify(&self, path: PathBuf) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Register before spawning so the timer task always finds its entry.
        if let Some(previous) = self.timers.insert(
            path.clone(),
            Timer {
                generation,
                handle: None,
            },
        ) {
            if let Some(handle) = previous.handle {
                handle.abort();
            }
            trace!(path = %path.display(), "Debounce timer re-armed");
        }

        let timers = Arc::clone(&self.timers);
        let expired = self.expired.clone();
        let quiet = self.quiet;
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            // Only the latest generation for a path may fire, and only once.
            if timers
                .remove_if(&key, |_, timer| timer.generation == generation)
                .is_some()
            {
                let _ = expired.send(key);
            }
        });

        match self.timers.get_mut(&path) {
            Some(mut timer) if timer.generation == generation => timer.handle = Some(handle),
            // Superseded or already fired in the meantime
            _ => {}
        }
    }

    /// Number of paths with an armed timer
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every armed timer without firing it
    pub fn cancel_all(&self) {
        self.timers.retain(|_, timer| {
            if let Some(handle) = timer.handle.take() {
                handle.abort();
            }
            false
        });
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
