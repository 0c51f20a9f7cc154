//! Filesystem watch collaborator
//!
//! Wraps `notify::RecommendedWatcher`. The notify callback runs on the
//! backend's own thread and forwards into a tokio broadcast channel, which
//! never blocks the sender.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Watch root does not exist or is not a directory: {0}")]
    MissingDirectory(PathBuf),
    #[error("Filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("Watcher lock poisoned")]
    Poisoned,
}

/// Raw file system event as delivered to the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub path: PathBuf,
    pub event_type: SystemEventType,
    /// Milliseconds since the epoch at which the event was received
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SystemEventType {
    Created,
    Modified,
    Deleted,
    Moved,
    MetadataChanged,
}

impl SystemEventType {
    /// Map a notify event kind; access and unknown kinds are dropped
    pub fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(SystemEventType::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(SystemEventType::Moved),
            EventKind::Modify(ModifyKind::Metadata(_)) => Some(SystemEventType::MetadataChanged),
            EventKind::Modify(_) => Some(SystemEventType::Modified),
            EventKind::Remove(_) => Some(SystemEventType::Deleted),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
        }
    }

    /// Whether the event may carry new content for its path
    pub fn may_change_content(self) -> bool {
        !matches!(self, SystemEventType::Deleted)
    }
}

impl SystemEvent {
    pub fn new(path: impl Into<PathBuf>, event_type: SystemEventType) -> Self {
        Self {
            path: path.into(),
            event_type,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// File system watcher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatcherStats {
    pub total_events: u64,
    pub dropped_events: u64,
    pub backend_errors: u64,
    pub watched_directories: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_events: AtomicU64,
    dropped_events: AtomicU64,
    backend_errors: AtomicU64,
}

pub struct SystemWatcher {
    watcher: Mutex<RecommendedWatcher>,
    watched_paths: DashMap<PathBuf, bool>, // path -> recursive
    event_sender: broadcast::Sender<SystemEvent>,
    counters: Arc<Counters>,
}

impl SystemWatcher {
    /// Create a watcher whose broadcast channel holds `buffer_size` events
    pub fn new(buffer_size: usize) -> Result<Self, WatchError> {
        let (event_sender, _) = broadcast::channel(buffer_size);
        let counters = Arc::new(Counters::default());

        let watcher = {
            let sender = event_sender.clone();
            let counters = Arc::clone(&counters);
            RecommendedWatcher::new(
                move |res: notify::Result<Event>| match res {
                    Ok(event) => forward(&sender, &counters, event),
                    Err(e) => {
                        counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Filesystem watcher error: {}", e);
                    }
                },
                notify::Config::default(),
            )?
        };

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched_paths: DashMap::new(),
            event_sender,
            counters,
        })
    }

    /// Watch a directory for file system changes
    pub fn watch_directory<P: AsRef<Path>>(&self, path: P, recursive: bool) -> Result<(), WatchError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(WatchError::MissingDirectory(path.to_path_buf()));
        }

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        self.watcher
            .lock()
            .map_err(|_| WatchError::Poisoned)?
            .watch(path, mode)?;
        self.watched_paths.insert(path.to_path_buf(), recursive);

        info!(
            "Watching directory: {} (recursive: {})",
            path.display(),
            recursive
        );
        Ok(())
    }

    /// Subscribe to file system events
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.event_sender.subscribe()
    }

    /// Get current watcher statistics
    pub fn get_stats(&self) -> WatcherStats {
        WatcherStats {
            total_events: self.counters.total_events.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
            watched_directories: self.watched_paths.len(),
        }
    }
}

fn forward(sender: &broadcast::Sender<SystemEvent>, counters: &Counters, event: Event) {
    let Some(event_type) = SystemEventType::from_kind(&event.kind) else {
        return;
    };

    for path in event.paths {
        counters.total_events.fetch_add(1, Ordering::Relaxed);
        if sender.send(SystemEvent::new(path, event_type)).is_err() {
            counters.dropped_events.fetch_add(1, Ordering::Relaxed);
            debug!("No event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            SystemEventType::from_kind(&EventKind::Create(CreateKind::File)),
            Some(SystemEventType::Created)
        );
        assert_eq!(
            SystemEventType::from_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(SystemEventType::Modified)
        );
        assert_eq!(
            SystemEventType::from_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(SystemEventType::Moved)
        );
        assert_eq!(
            SystemEventType::from_kind(&EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::WriteTime
            ))),
            Some(SystemEventType::MetadataChanged)
        );
        assert_eq!(
            SystemEventType::from_kind(&EventKind::Remove(RemoveKind::File)),
            Some(SystemEventType::Deleted)
        );
        assert_eq!(SystemEventType::from_kind(&EventKind::Any), None);
    }

    #[test]
    fn test_forward_counts_drops_without_subscribers() {
        let (sender, _) = broadcast::channel(4);
        let counters = Counters::default();
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path("/tmp/a.json".into());

        forward(&sender, &counters, event);

        assert_eq!(counters.total_events.load(Ordering::Relaxed), 1);
        assert_eq!(counters.dropped_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_missing_directory_rejected() {
        let watcher = SystemWatcher::new(16).unwrap();
        let err = watcher
            .watch_directory("/definitely/not/here", true)
            .unwrap_err();
        assert!(matches!(err, WatchError::MissingDirectory(_)));
        assert_eq!(watcher.get_stats().watched_directories, 0);
    }

    #[tokio::test]
    async fn test_watcher_reports_writes() {
        let dir = tempdir().unwrap();
        let watcher = SystemWatcher::new(1024).unwrap();
        watcher.watch_directory(dir.path(), true).unwrap();
        let mut events = watcher.subscribe();

        let file = dir.path().join("a.json");
        tokio::fs::write(&file, b"[]").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.path.file_name() == file.file_name() => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("watcher channel closed: {e}"),
                }
            }
        })
        .await
        .expect("no event for written file");

        assert!(received.event_type.may_change_content());
        assert_eq!(watcher.get_stats().watched_directories, 1);
    }
}
