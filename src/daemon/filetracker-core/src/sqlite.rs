//! SQLite-backed store
//!
//! Schema matches the `fileTracker.db` layout: a `files` table keyed by
//! filename and a `users` table with unique usernames. Databases written by
//! older tooling may hold fractional millisecond timestamps in `files`; those
//! are read back truncated to whole milliseconds.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{CredentialStore, TrackedFileStore, User};
use crate::{Timestamp, TrackedFile};

/// SQLite store shared by the watch pipeline, the aggregator and the login path
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(|source| StoreError::Open {
            path: db_path.display().to_string(),
            source,
        })?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        debug!("Opened tracked-file store at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE,
                password TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                filename TEXT PRIMARY KEY,
                last_modified INTEGER
            )",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    match row.get_ref(idx)? {
        ValueRef::Integer(ms) => Ok(ms),
        ValueRef::Real(ms) => Ok(ms as Timestamp),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "last_modified".to_string(),
            other.data_type(),
        )),
    }
}

impl TrackedFileStore for SqliteStore {
    fn get(&self, path: &str) -> Result<Option<Timestamp>, StoreError> {
        let conn = self.lock()?;
        let stored = conn
            .query_row(
                "SELECT last_modified FROM files WHERE filename = ?1",
                params![path],
                |row| timestamp_column(row, 0),
            )
            .optional()?;
        Ok(stored)
    }

    fn upsert(&self, path: &str, timestamp: Timestamp) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "REPLACE INTO files (filename, last_modified) VALUES (?1, ?2)",
            params![path, timestamp],
        )?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<TrackedFile>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT filename, last_modified FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok(TrackedFile {
                path: row.get(0)?,
                last_modified: timestamp_column(row, 1)?,
            })
        })?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn remove(&self, path: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM files WHERE filename = ?1", params![path])?;
        Ok(removed > 0)
    }
}

impl CredentialStore for SqliteStore {
    fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT id, username, password FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn insert_user_if_absent(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password) VALUES (?1, ?2)",
            params![username, password_hash],
        )?;
        Ok(inserted > 0)
    }

    fn set_password(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (username, password) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET password = excluded.password",
            params![username, password_hash],
        )?;
        Ok(())
    }
}
