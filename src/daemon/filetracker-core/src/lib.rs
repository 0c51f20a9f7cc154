//! filetracker Core - tracked-file state, change detection and aggregation
//!
//! This crate owns the durable view of which files have been seen and when.
//! It knows nothing about filesystem watching or HTTP; those layers depend on
//! the traits defined here and receive their store handles by injection.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod aggregator;
pub mod detector;
pub mod error;
pub mod sqlite;
pub mod store;

pub use aggregator::{load_records, Aggregation, Aggregator};
pub use detector::{ChangeDetector, Observation};
pub use error::{AuthError, ParseError, StatError, StoreError};
pub use sqlite::SqliteStore;
pub use store::{CredentialStore, MemoryStore, TrackedFileStore, User};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Last accepted modification time of one file under the watched tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub last_modified: Timestamp,
}

/// Emitted once per accepted change; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub timestamp: Timestamp,
}

/// Convert a filesystem time into whole milliseconds since the epoch.
///
/// Times before the epoch clamp to zero.
pub fn timestamp_from_system_time(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Timestamp)
        .unwrap_or(0)
}
