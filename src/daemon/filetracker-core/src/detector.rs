//! Change detection over the tracked-file store
//!
//! An observation is accepted only when it is strictly newer than what the
//! store holds. The lookup/compare/upsert sequence runs under a per-path
//! lock so two concurrent observations of the same file cannot both read a
//! stale value and both write. Different paths never contend.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;

use crate::error::StoreError;
use crate::store::TrackedFileStore;
use crate::{ChangeEvent, Timestamp};

/// Result of feeding one `(path, timestamp)` observation to the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Store was updated; the event should be broadcast
    Changed(ChangeEvent),
    /// Store already holds this or a later timestamp
    Unchanged { stored: Timestamp },
}

impl Observation {
    pub fn is_changed(&self) -> bool {
        matches!(self, Observation::Changed(_))
    }
}

pub struct ChangeDetector {
    store: Arc<dyn TrackedFileStore>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn TrackedFileStore>) -> Self {
        Self {
            store,
            path_locks: DashMap::new(),
        }
    }

    /// Strictly-greater comparison; equal timestamps are a no-op write
    pub fn is_newer(stored: Option<Timestamp>, observed: Timestamp) -> bool {
        match stored {
            None => true,
            Some(stored) => observed > stored,
        }
    }

    /// Classify an observation and, when it is new, record it
    pub fn observe(&self, path: &str, observed: Timestamp) -> Result<Observation, StoreError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().map_err(|_| StoreError::Poisoned)?;

        let stored = self.store.get(path)?;
        match stored {
            Some(stored) if !Self::is_newer(Some(stored), observed) => {
                debug!(path, stored, observed, "Observation unchanged");
                Ok(Observation::Unchanged { stored })
            }
            _ => {
                self.store.upsert(path, observed)?;
                debug!(path, ?stored, observed, "Observation accepted");
                Ok(Observation::Changed(ChangeEvent {
                    path: path.to_string(),
                    timestamp: observed,
                }))
            }
        }
    }

    /// Drop the store record for a path whose file is gone, and its lock
    /// once no other caller holds it
    pub fn forget(&self, path: &str) -> Result<bool, StoreError> {
        let removed = {
            let lock = self.lock_for(path);
            let _guard = lock.lock().map_err(|_| StoreError::Poisoned)?;
            self.store.remove(path)?
        };

        // Clones are only handed out under the shard lock `remove_if` holds,
        // so a count of one means no caller has or can get this lock.
        self.path_locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
        Ok(removed)
    }

    fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn detector() -> (Arc<MemoryStore>, ChangeDetector) {
        let store = Arc::new(MemoryStore::new());
        let detector = ChangeDetector::new(store.clone());
        (store, detector)
    }

    #[test]
    fn test_scenario_new_same_newer() {
        let (store, detector) = detector();

        let first = detector.observe("a.json", 1000).unwrap();
        assert_eq!(
            first,
            Observation::Changed(ChangeEvent {
                path: "a.json".to_string(),
                timestamp: 1000,
            })
        );
        assert_eq!(store.get("a.json").unwrap(), Some(1000));

        let repeat = detector.observe("a.json", 1000).unwrap();
        assert_eq!(repeat, Observation::Unchanged { stored: 1000 });

        let newer = detector.observe("a.json", 2000).unwrap();
        assert!(newer.is_changed());
        assert_eq!(store.get("a.json").unwrap(), Some(2000));
    }

    #[test]
    fn test_older_observation_never_regresses() {
        let (store, detector) = detector();
        detector.observe("a.json", 5000).unwrap();

        let older = detector.observe("a.json", 4000).unwrap();
        assert_eq!(older, Observation::Unchanged { stored: 5000 });
        assert_eq!(store.get("a.json").unwrap(), Some(5000));
    }

    #[test]
    fn test_is_newer() {
        assert!(ChangeDetector::is_newer(None, 0));
        assert!(ChangeDetector::is_newer(Some(1), 2));
        assert!(!ChangeDetector::is_newer(Some(2), 2));
        assert!(!ChangeDetector::is_newer(Some(3), 2));
    }

    #[test]
    fn test_concurrent_same_path_accepts_once() {
        let (_store, detector) = detector();
        let detector = Arc::new(detector);
        let accepted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let detector = Arc::clone(&detector);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    if detector.observe("shared.json", 7000).unwrap().is_changed() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forget_removes_record() {
        let (store, detector) = detector();
        detector.observe("a.json", 1000).unwrap();

        assert!(detector.forget("a.json").unwrap());
        assert_eq!(store.get("a.json").unwrap(), None);

        // Once forgotten, the same timestamp counts as new again
        assert!(detector.observe("a.json", 1000).unwrap().is_changed());
    }

    #[test]
    fn test_forget_releases_path_lock() {
        let (_store, detector) = detector();
        for i in 0..50 {
            let path = format!("short-lived-{}.json", i);
            detector.observe(&path, 1000).unwrap();
            detector.forget(&path).unwrap();
        }
        assert_eq!(detector.path_locks.len(), 0);

        detector.observe("kept.json", 1000).unwrap();
        assert_eq!(detector.path_locks.len(), 1);
    }

    #[test]
    fn test_forget_keeps_lock_held_elsewhere() {
        let (_store, detector) = detector();
        detector.observe("a.json", 1000).unwrap();

        let held = detector.lock_for("a.json");
        detector.forget("a.json").unwrap();
        assert_eq!(detector.path_locks.len(), 1);

        drop(held);
        detector.forget("a.json").unwrap();
        assert_eq!(detector.path_locks.len(), 0);
    }
}
