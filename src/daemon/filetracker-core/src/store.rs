//! Persistence contracts for tracked files and login credentials
//!
//! Components receive an `Arc<dyn TrackedFileStore>` (or `CredentialStore`)
//! at construction; nothing reaches for a process-wide handle.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::{Timestamp, TrackedFile};

/// Path -> last accepted modification time.
///
/// `upsert` is unconditional. Deciding whether a write is warranted belongs
/// to [`crate::ChangeDetector`], which also serializes per-path access.
pub trait TrackedFileStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Timestamp>, StoreError>;
    fn upsert(&self, path: &str, timestamp: Timestamp) -> Result<(), StoreError>;
    /// Every record, in no particular order
    fn list_all(&self) -> Result<Vec<TrackedFile>, StoreError>;
    /// Drop the record for `path`. Returns whether one existed.
    fn remove(&self, path: &str) -> Result<bool, StoreError>;
}

/// Stored login credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// bcrypt hash, never the plain password
    #[serde(skip_serializing)]
    pub password_hash: String,
}

pub trait CredentialStore: Send + Sync {
    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError>;
    /// Insert unless the username exists. Returns whether a row was written.
    fn insert_user_if_absent(&self, username: &str, password_hash: &str)
        -> Result<bool, StoreError>;
    /// Create the user or replace its password hash
    fn set_password(&self, username: &str, password_hash: &str) -> Result<(), StoreError>;
}

/// Volatile store used by tests and by runs without a database file
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: DashMap<String, Timestamp>,
    users: DashMap<String, User>,
    next_user_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_user(&self, username: &str, password_hash: &str) -> User {
        User {
            id: self.next_user_id.fetch_add(1, Ordering::Relaxed) + 1,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
        }
    }
}

impl TrackedFileStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<Timestamp>, StoreError> {
        Ok(self.files.get(path).map(|entry| *entry))
    }

    fn upsert(&self, path: &str, timestamp: Timestamp) -> Result<(), StoreError> {
        self.files.insert(path.to_string(), timestamp);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<TrackedFile>, StoreError> {
        Ok(self
            .files
            .iter()
            .map(|entry| TrackedFile {
                path: entry.key().clone(),
                last_modified: *entry.value(),
            })
            .collect())
    }

    fn remove(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.files.remove(path).is_some())
    }
}

impl CredentialStore for MemoryStore {
    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(username).map(|entry| entry.clone()))
    }

    fn insert_user_if_absent(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        let mut inserted = false;
        self.users.entry(username.to_string()).or_insert_with(|| {
            inserted = true;
            self.allocate_user(username, password_hash)
        });
        Ok(inserted)
    }

    fn set_password(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        self.users
            .entry(username.to_string())
            .and_modify(|user| user.password_hash = password_hash.to_string())
            .or_insert_with(|| self.allocate_user(username, password_hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_upsert_replaces() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a.json").unwrap(), None);

        store.upsert("a.json", 1000).unwrap();
        store.upsert("a.json", 2000).unwrap();

        assert_eq!(store.get("a.json").unwrap(), Some(2000));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_remove() {
        let store = MemoryStore::new();
        store.upsert("a.json", 1000).unwrap();

        assert!(store.remove("a.json").unwrap());
        assert!(!store.remove("a.json").unwrap());
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_memory_credentials() {
        let store = MemoryStore::new();
        assert!(store.insert_user_if_absent("admin", "h1").unwrap());
        assert!(!store.insert_user_if_absent("admin", "h2").unwrap());
        assert_eq!(store.find_user("admin").unwrap().unwrap().password_hash, "h1");

        store.set_password("admin", "h3").unwrap();
        let user = store.find_user("admin").unwrap().unwrap();
        assert_eq!(user.password_hash, "h3");
        assert_eq!(user.id, 1);

        assert!(store.find_user("nobody").unwrap().is_none());
    }
}
