//! Watch pipeline: raw event -> debounce -> stat -> detect -> notify
//!
//! Raw events are filtered and handed to the [`Debouncer`]. Each path whose
//! quiet period elapses is processed in its own task, so a slow or failing
//! path never holds up the others. Stat and store failures are logged and
//! end processing for that path; the next event on it is the retry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filetracker_core::{
    timestamp_from_system_time, ChangeDetector, ChangeEvent, Observation, StatError, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::debouncer::Debouncer;
use crate::notifier::Notifier;
use crate::watcher::{SystemEvent, SystemEventType};

/// Decides which paths the pipeline reacts to
pub trait PathFilter: Send + Sync {
    fn should_watch(&self, path: &Path) -> bool;
}

/// Filter that lets every path through
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PathFilter for AcceptAll {
    fn should_watch(&self, _path: &Path) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Debounce quiet period per path
    pub quiet_period: Duration,
    /// Remove store records of files reported deleted
    pub prune_deleted: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1000),
            prune_deleted: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Stat(#[from] StatError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What processing one debounced path produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Changed(ChangeEvent),
    Unchanged,
    /// Path is not a regular file
    Skipped,
}

/// Pipeline counters snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub events_received: u64,
    pub events_filtered: u64,
    pub actions_fired: u64,
    pub changes_accepted: u64,
    pub unchanged: u64,
    pub stat_errors: u64,
    pub store_errors: u64,
    pub pruned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_filtered: AtomicU64,
    actions_fired: AtomicU64,
    changes_accepted: AtomicU64,
    unchanged: AtomicU64,
    stat_errors: AtomicU64,
    store_errors: AtomicU64,
    pruned: AtomicU64,
}

pub struct WatchPipeline {
    detector: Arc<ChangeDetector>,
    notifier: Notifier,
    filter: Arc<dyn PathFilter>,
    debouncer: Debouncer,
    config: PipelineConfig,
    counters: Counters,
}

impl WatchPipeline {
    /// Build the pipeline and the receiver of its debounced paths
    pub fn new(
        detector: Arc<ChangeDetector>,
        notifier: Notifier,
        filter: Arc<dyn PathFilter>,
        config: PipelineConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PathBuf>) {
        let (debouncer, expired) = Debouncer::new(config.quiet_period);
        let pipeline = Arc::new(Self {
            detector,
            notifier,
            filter,
            debouncer,
            config,
            counters: Counters::default(),
        });
        (pipeline, expired)
    }

    /// Run the pipeline over a raw event stream until it closes
    pub fn start(
        self: &Arc<Self>,
        events: broadcast::Receiver<SystemEvent>,
        expired: mpsc::UnboundedReceiver<PathBuf>,
    ) -> PipelineHandle {
        let ingest = tokio::spawn(Arc::clone(self).ingest_loop(events));
        let actions = tokio::spawn(Arc::clone(self).action_loop(expired));
        info!(
            "Started watch pipeline (quiet period: {:?}, prune deleted: {})",
            self.config.quiet_period, self.config.prune_deleted
        );
        PipelineHandle {
            pipeline: Arc::clone(self),
            tasks: vec![ingest, actions],
        }
    }

    async fn ingest_loop(self: Arc<Self>, mut events: broadcast::Receiver<SystemEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Watch pipeline lagged, {} raw events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Raw event channel closed");
                    break;
                }
            }
        }
    }

    async fn action_loop(self: Arc<Self>, mut expired: mpsc::UnboundedReceiver<PathBuf>) {
        while let Some(path) = expired.recv().await {
            self.counters.actions_fired.fetch_add(1, Ordering::Relaxed);
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move {
                pipeline.run_action(path).await;
            });
        }
    }

    /// Route one raw event: content events are debounced, deletions pruned
    pub fn handle_event(self: &Arc<Self>, event: SystemEvent) {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        if !self.filter.should_watch(&event.path) {
            self.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match event.event_type {
            // A rename reports both ends; only the side still present has content
            SystemEventType::Moved if self.config.prune_deleted => {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move {
                    if tokio::fs::try_exists(&event.path).await.unwrap_or(false) {
                        pipeline.debouncer.notify(event.path);
                    } else {
                        pipeline.prune(&event.path).await;
                    }
                });
            }
            event_type if event_type.may_change_content() => {
                self.debouncer.notify(event.path);
            }
            _ if self.config.prune_deleted => {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move {
                    pipeline.prune(&event.path).await;
                });
            }
            _ => {}
        }
    }

    /// Queue a path as if a change event had arrived for it
    pub fn submit(&self, path: PathBuf) {
        if self.filter.should_watch(&path) {
            self.debouncer.notify(path);
        }
    }

    /// Submit every matching file under `root`; returns how many were queued.
    ///
    /// Unreadable directories and entries are logged and skipped.
    pub async fn scan(&self, root: &Path, recursive: bool) -> usize {
        let mut queued = 0;
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Directory listing failed");
                        break;
                    }
                };
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                if file_type.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                } else if file_type.is_file() && self.filter.should_watch(&path) {
                    self.debouncer.notify(path);
                    queued += 1;
                }
            }
        }

        debug!("Startup scan of {} queued {} files", root.display(), queued);
        queued
    }

    async fn run_action(&self, path: PathBuf) {
        match self.process_path(&path).await {
            Ok(Outcome::Changed(event)) => {
                debug!(path = %event.path, timestamp = event.timestamp, "Change broadcast");
            }
            Ok(Outcome::Unchanged) | Ok(Outcome::Skipped) => {}
            Err(PipelineError::Stat(e)) => {
                warn!(path = %path.display(), error = %e, "Error processing file");
            }
            Err(PipelineError::Store(e)) => {
                error!(path = %path.display(), error = %e, "Tracked-file store failure");
            }
        }
    }

    /// Stat `path`, run change detection, and broadcast if it changed
    pub async fn process_path(&self, path: &Path) -> Result<Outcome, PipelineError> {
        let key = path.to_string_lossy().into_owned();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(source) => return Err(self.stat_failed(key, source)),
        };
        if !metadata.is_file() {
            return Ok(Outcome::Skipped);
        }
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(source) => return Err(self.stat_failed(key, source)),
        };

        let observed = timestamp_from_system_time(modified);
        let detector = Arc::clone(&self.detector);
        let observation = tokio::task::spawn_blocking(move || detector.observe(&key, observed))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|observation| observation);

        match observation {
            Ok(Observation::Changed(event)) => {
                self.counters.changes_accepted.fetch_add(1, Ordering::Relaxed);
                self.notifier.broadcast(event.clone());
                Ok(Outcome::Changed(event))
            }
            Ok(Observation::Unchanged { .. }) => {
                self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::Unchanged)
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    fn stat_failed(&self, path: String, source: std::io::Error) -> PipelineError {
        self.counters.stat_errors.fetch_add(1, Ordering::Relaxed);
        StatError { path, source }.into()
    }

    async fn prune(&self, path: &Path) {
        // A delete followed by a quick re-create leaves the file in place
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return;
        }

        let key = path.to_string_lossy().into_owned();
        let detector = Arc::clone(&self.detector);
        let forget_key = key.clone();
        let forgotten = tokio::task::spawn_blocking(move || detector.forget(&forget_key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|forgotten| forgotten);

        match forgotten {
            Ok(true) => {
                self.counters.pruned.fetch_add(1, Ordering::Relaxed);
                info!(path = %key, "Pruned deleted file from store");
            }
            Ok(false) => {}
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(path = %key, error = %e, "Failed to prune deleted file");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.debouncer.pending()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            events_received: c.events_received.load(Ordering::Relaxed),
            events_filtered: c.events_filtered.load(Ordering::Relaxed),
            actions_fired: c.actions_fired.load(Ordering::Relaxed),
            changes_accepted: c.changes_accepted.load(Ordering::Relaxed),
            unchanged: c.unchanged.load(Ordering::Relaxed),
            stat_errors: c.stat_errors.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            pruned: c.pruned.load(Ordering::Relaxed),
        }
    }
}

/// Running pipeline; aborting it stops both loops and pending timers
pub struct PipelineHandle {
    pipeline: Arc<WatchPipeline>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn shutdown(self) {
        self.pipeline.debouncer.cancel_all();
        for task in self.tasks {
            task.abort();
        }
        info!("Watch pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetracker_core::{MemoryStore, TrackedFileStore};
    use std::time::UNIX_EPOCH;
    use tempfile::tempdir;

    struct JsonOnly;

    impl PathFilter for JsonOnly {
        fn should_watch(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "json")
        }
    }

    fn pipeline(
        filter: Arc<dyn PathFilter>,
        config: PipelineConfig,
    ) -> (
        Arc<MemoryStore>,
        Notifier,
        Arc<WatchPipeline>,
        mpsc::UnboundedReceiver<PathBuf>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let detector = Arc::new(ChangeDetector::new(store.clone()));
        let notifier = Notifier::new(16);
        let (pipeline, expired) = WatchPipeline::new(detector, notifier.clone(), filter, config);
        (store, notifier, pipeline, expired)
    }

    fn set_mtime(path: &Path, millis: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_millis(millis))
            .unwrap();
    }

    #[tokio::test]
    async fn test_process_path_detects_changes_once() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "[]").unwrap();
        set_mtime(&file, 1_000);

        let (store, notifier, pipeline, _expired) =
            pipeline(Arc::new(AcceptAll), PipelineConfig::default());
        let mut changes = notifier.subscribe();
        let key = file.to_string_lossy().into_owned();

        let first = pipeline.process_path(&file).await.unwrap();
        assert!(matches!(first, Outcome::Changed(_)));
        assert_eq!(store.get(&key).unwrap(), Some(1_000));
        assert_eq!(changes.recv().await.unwrap().path, key);

        assert_eq!(pipeline.process_path(&file).await.unwrap(), Outcome::Unchanged);
        assert!(changes.try_recv().is_err());

        set_mtime(&file, 2_000);
        assert!(matches!(
            pipeline.process_path(&file).await.unwrap(),
            Outcome::Changed(_)
        ));
        assert_eq!(store.get(&key).unwrap(), Some(2_000));

        let stats = pipeline.stats();
        assert_eq!(stats.changes_accepted, 2);
        assert_eq!(stats.unchanged, 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_stat_error_without_mutation() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gone.json");

        let (store, _notifier, pipeline, _expired) =
            pipeline(Arc::new(AcceptAll), PipelineConfig::default());

        let err = pipeline.process_path(&file).await.unwrap_err();
        assert!(matches!(err, PipelineError::Stat(_)));
        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(pipeline.stats().stat_errors, 1);
    }

    #[tokio::test]
    async fn test_directories_are_skipped() {
        let dir = tempdir().unwrap();
        let (_store, _notifier, pipeline, _expired) =
            pipeline(Arc::new(AcceptAll), PipelineConfig::default());

        assert_eq!(pipeline.process_path(dir.path()).await.unwrap(), Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_filtered_events_never_reach_debouncer() {
        let (_store, _notifier, pipeline, _expired) =
            pipeline(Arc::new(JsonOnly), PipelineConfig::default());

        pipeline.handle_event(SystemEvent::new("/data/notes.txt", SystemEventType::Modified));
        pipeline.handle_event(SystemEvent::new("/data/a.json", SystemEventType::Modified));

        assert_eq!(pipeline.pending(), 1);
        let stats = pipeline.stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.events_filtered, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_burst_yields_single_notification() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "[]").unwrap();

        let config = PipelineConfig {
            quiet_period: Duration::from_millis(50),
            prune_deleted: false,
        };
        let (_store, notifier, pipeline, expired) = pipeline(Arc::new(AcceptAll), config);
        let mut changes = notifier.subscribe();

        let (raw_tx, raw_rx) = broadcast::channel(64);
        let handle = pipeline.start(raw_rx, expired);

        for _ in 0..5 {
            raw_tx
                .send(SystemEvent::new(file.clone(), SystemEventType::Modified))
                .unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, file.to_string_lossy());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(changes.try_recv().is_err());
        assert_eq!(pipeline.stats().actions_fired, 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_prune_deleted_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "[]").unwrap();

        let config = PipelineConfig {
            prune_deleted: true,
            ..Default::default()
        };
        let (store, _notifier, pipeline, _expired) = pipeline(Arc::new(AcceptAll), config);
        pipeline.process_path(&file).await.unwrap();
        assert_eq!(store.list_all().unwrap().len(), 1);

        std::fs::remove_file(&file).unwrap();
        pipeline.prune(&file).await;

        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(pipeline.stats().pruned, 1);
    }

    #[tokio::test]
    async fn test_scan_queues_matching_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.json"), "[]").unwrap();
        std::fs::write(dir.path().join("nested/b.json"), "[]").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();

        let (_store, _notifier, pipeline, _expired) =
            pipeline(Arc::new(JsonOnly), PipelineConfig::default());

        assert_eq!(pipeline.scan(dir.path(), true).await, 2);
        assert_eq!(pipeline.pending(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_skips_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("hidden.json"), "[]").unwrap();
        std::fs::write(dir.path().join("a.json"), "[]").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let config = PipelineConfig {
            quiet_period: Duration::from_millis(10),
            prune_deleted: false,
        };
        let (_store, _notifier, pipeline, mut expired) = pipeline(Arc::new(JsonOnly), config);
        let queued = pipeline.scan(dir.path(), true).await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Privileged runs can still read the locked directory
        assert!(queued >= 1);
        let mut fired = Vec::new();
        for _ in 0..queued {
            let path = tokio::time::timeout(Duration::from_secs(5), expired.recv())
                .await
                .unwrap()
                .unwrap();
            fired.push(path);
        }
        assert!(fired.contains(&dir.path().join("a.json")));
    }

    #[tokio::test]
    async fn test_scan_of_missing_root_queues_nothing() {
        let dir = tempdir().unwrap();
        let (_store, _notifier, pipeline, _expired) =
            pipeline(Arc::new(AcceptAll), PipelineConfig::default());

        assert_eq!(pipeline.scan(&dir.path().join("absent"), true).await, 0);
        assert_eq!(pipeline.pending(), 0);
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rename_out_of_tree_prunes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "[]").unwrap();

        let config = PipelineConfig {
            prune_deleted: true,
            ..Default::default()
        };
        let (store, _notifier, pipeline, _expired) = pipeline(Arc::new(AcceptAll), config);
        pipeline.process_path(&file).await.unwrap();

        std::fs::rename(&file, dir.path().join("moved.bak")).unwrap();
        pipeline.handle_event(SystemEvent::new(file.clone(), SystemEventType::Moved));

        wait_until(|| store.list_all().unwrap().is_empty()).await;
        assert_eq!(pipeline.stats().pruned, 1);
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    async fn test_rename_into_tree_is_debounced() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.json");
        std::fs::write(&file, "[]").unwrap();

        let config = PipelineConfig {
            prune_deleted: true,
            ..Default::default()
        };
        let (_store, _notifier, pipeline, _expired) = pipeline(Arc::new(AcceptAll), config);
        pipeline.handle_event(SystemEvent::new(file, SystemEventType::Moved));

        wait_until(|| pipeline.pending() == 1).await;
        assert_eq!(pipeline.stats().pruned, 0);
    }
}
