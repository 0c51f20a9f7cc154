//! Error taxonomy shared by every filetracker layer

use thiserror::Error;

/// Backing storage failed; fatal to the triggering operation only
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Store lock poisoned")]
    Poisoned,
    #[error("Store task failed: {0}")]
    Task(String),
}

/// A file vanished or became unreadable between its event and the stat
#[derive(Error, Debug)]
#[error("Failed to stat {path}: {source}")]
pub struct StatError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// A tracked file could not be turned into records during aggregation
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Expected a JSON array in {path}, found {found}")]
    NotAnArray { path: String, found: &'static str },
}

impl ParseError {
    /// Path of the file that failed
    pub fn path(&self) -> &str {
        match self {
            ParseError::Read { path, .. }
            | ParseError::Json { path, .. }
            | ParseError::NotAnArray { path, .. } => path,
        }
    }
}

/// Login rejected, or the credential backend failed while checking it
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid username!")]
    UnknownUser,
    #[error("Invalid password!")]
    WrongPassword,
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// True for the two rejections a caller is allowed to see
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::UnknownUser | AuthError::WrongPassword)
    }
}
