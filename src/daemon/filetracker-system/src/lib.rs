//! filetracker System Integration
//!
//! Bridges the OS file-notification layer into async tokio channels and runs
//! the debounced change-detection pipeline on top of it.

pub mod debouncer;
pub mod notifier;
pub mod pipeline;
pub mod watcher;

pub use debouncer::Debouncer;
pub use notifier::Notifier;
pub use pipeline::{
    AcceptAll, Outcome, PathFilter, PipelineConfig, PipelineError, PipelineHandle, PipelineStats,
    WatchPipeline,
};
pub use watcher::{SystemEvent, SystemEventType, SystemWatcher, WatchError, WatcherStats};
