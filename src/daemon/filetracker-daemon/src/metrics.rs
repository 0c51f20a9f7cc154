//! Metrics collection and reporting
//! Follows SRP: Only responsible for metrics collection and export

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use filetracker_core::Aggregation;
use filetracker_system::{PipelineStats, WatcherStats};
use metrics::{counter, gauge, histogram};

/// Metrics collector for daemon statistics
pub struct MetricsCollector {
    start_time: Instant,
    aggregations: AtomicU64,
    records_served: AtomicU64,
    skipped_files: AtomicU64,
    logins_accepted: AtomicU64,
    logins_rejected: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            aggregations: AtomicU64::new(0),
            records_served: AtomicU64::new(0),
            skipped_files: AtomicU64::new(0),
            logins_accepted: AtomicU64::new(0),
            logins_rejected: AtomicU64::new(0),
        }
    }

    /// Record one aggregation pass
    pub fn record_aggregation(&self, aggregation: &Aggregation, elapsed: Duration) {
        let records = aggregation.records.len() as u64;
        let skipped = aggregation.skipped.len() as u64;

        counter!("filetracker_aggregations_total").increment(1);
        counter!("filetracker_aggregated_records_total").increment(records);
        counter!("filetracker_aggregation_skipped_files_total").increment(skipped);
        histogram!("filetracker_aggregation_duration_seconds").record(elapsed.as_secs_f64());

        self.aggregations.fetch_add(1, Ordering::Relaxed);
        self.records_served.fetch_add(records, Ordering::Relaxed);
        self.skipped_files.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Record a login attempt
    pub fn record_login(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        counter!("filetracker_logins_total", "outcome" => outcome).increment(1);

        if accepted {
            self.logins_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.logins_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Update watch pipeline statistics
    pub fn update_pipeline_stats(&self, stats: &PipelineStats, pending_timers: usize) {
        gauge!("filetracker_pipeline_events_received").set(stats.events_received as f64);
        gauge!("filetracker_pipeline_events_filtered").set(stats.events_filtered as f64);
        gauge!("filetracker_pipeline_actions_fired").set(stats.actions_fired as f64);
        gauge!("filetracker_pipeline_changes_accepted").set(stats.changes_accepted as f64);
        gauge!("filetracker_pipeline_unchanged").set(stats.unchanged as f64);
        gauge!("filetracker_pipeline_stat_errors").set(stats.stat_errors as f64);
        gauge!("filetracker_pipeline_store_errors").set(stats.store_errors as f64);
        gauge!("filetracker_pipeline_pruned").set(stats.pruned as f64);
        gauge!("filetracker_debounce_pending_timers").set(pending_timers as f64);
    }

    /// Update watcher statistics
    pub fn update_watcher_stats(&self, stats: &WatcherStats, subscribers: usize) {
        gauge!("filetracker_watcher_total_events").set(stats.total_events as f64);
        gauge!("filetracker_watcher_dropped_events").set(stats.dropped_events as f64);
        gauge!("filetracker_watcher_backend_errors").set(stats.backend_errors as f64);
        gauge!("filetracker_watched_directories").set(stats.watched_directories as f64);
        gauge!("filetracker_change_subscribers").set(subscribers as f64);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            aggregations: self.aggregations.load(Ordering::Relaxed),
            records_served: self.records_served.load(Ordering::Relaxed),
            skipped_files: self.skipped_files.load(Ordering::Relaxed),
            logins_accepted: self.logins_accepted.load(Ordering::Relaxed),
            logins_rejected: self.logins_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics statistics snapshot
#[derive(Debug, Clone)]
pub struct MetricsStats {
    pub uptime_seconds: u64,
    pub aggregations: u64,
    pub records_served: u64,
    pub skipped_files: u64,
    pub logins_accepted: u64,
    pub logins_rejected: u64,
}
