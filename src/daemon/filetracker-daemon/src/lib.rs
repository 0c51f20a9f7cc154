//! filetracker daemon library
//!
//! Watches a directory of JSON files, tracks their modification times,
//! and serves the aggregate over HTTP with a live update channel.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod export;
pub mod http;
pub mod metrics;

pub use config::{ConfigManager, DaemonConfig};
pub use daemon::{Daemon, DaemonStats};
pub use http::{AppState, HttpServer};
