//! On-demand union of every tracked file's JSON records
//!
//! Aggregation takes no lock against the watch pipeline. A request racing an
//! upsert may see the store as it was one update earlier; the next request
//! sees the new state. Nothing is cached between requests.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ParseError, StoreError};
use crate::store::TrackedFileStore;

/// Records from every readable file plus the files that were skipped
#[derive(Debug, Default)]
pub struct Aggregation {
    pub records: Vec<Value>,
    pub skipped: Vec<ParseError>,
}

pub struct Aggregator {
    store: Arc<dyn TrackedFileStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn TrackedFileStore>) -> Self {
        Self { store }
    }

    /// Concatenated records of all tracked files, in store iteration order
    pub async fn aggregate_all(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.aggregate().await?.records)
    }

    /// Like [`Aggregator::aggregate_all`] but also reports skipped files.
    ///
    /// Only a store failure aborts the pass. A file that cannot be read or is
    /// not a JSON array contributes nothing and is logged.
    pub async fn aggregate(&self) -> Result<Aggregation, StoreError> {
        let store = Arc::clone(&self.store);
        let files = tokio::task::spawn_blocking(move || store.list_all())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        let mut aggregation = Aggregation::default();

        for file in files {
            match load_records(&file.path).await {
                Ok(mut records) => {
                    debug!(path = %file.path, count = records.len(), "Loaded records");
                    aggregation.records.append(&mut records);
                }
                Err(e) => {
                    warn!(path = %file.path, error = %e, "Skipping tracked file");
                    aggregation.skipped.push(e);
                }
            }
        }

        Ok(aggregation)
    }
}

/// Read one file and return its top-level array elements
pub async fn load_records(path: impl AsRef<Path>) -> Result<Vec<Value>, ParseError> {
    let path = path.as_ref();
    let display = || path.display().to_string();

    let raw = tokio::fs::read(path).await.map_err(|source| ParseError::Read {
        path: display(),
        source,
    })?;

    let value: Value = serde_json::from_slice(&raw).map_err(|source| ParseError::Json {
        path: display(),
        source,
    })?;

    match value {
        Value::Array(records) => Ok(records),
        other => Err(ParseError::NotAnArray {
            path: display(),
            found: json_kind(&other),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
