//! Daemon orchestration: wires the store, watcher, pipeline and HTTP
//! server together and owns their background tasks

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use filetracker_core::{Aggregator, ChangeDetector, ChangeEvent, SqliteStore};
use filetracker_system::{
    Notifier, PipelineHandle, PipelineStats, SystemWatcher, WatchPipeline, WatcherStats,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, SessionStore};
use crate::config::{ConfigManager, DaemonConfig};
use crate::http::{self, AppState, HttpServer};
use crate::metrics::{MetricsCollector, MetricsStats};

const IN_MEMORY_DATABASE: &str = ":memory:";
const METRICS_INTERVAL: Duration = Duration::from_secs(10);
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Open the configured database, creating its parent directory
fn open_store(path: &Path) -> Result<Arc<SqliteStore>> {
    if path.as_os_str() == IN_MEMORY_DATABASE {
        return Ok(Arc::new(SqliteStore::in_memory()?));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(path)?;
    info!("Opened database: {}", path.display());
    Ok(Arc::new(store))
}

/// Main daemon orchestrator
pub struct Daemon {
    config: DaemonConfig,
    data_dir: PathBuf,
    system_watcher: Arc<SystemWatcher>,
    pipeline: Arc<WatchPipeline>,
    expired: Option<mpsc::UnboundedReceiver<PathBuf>>,
    notifier: Notifier,
    sessions: Arc<SessionStore>,
    http_server: HttpServer,
    metrics_collector: Arc<MetricsCollector>,
    shutdown_sender: broadcast::Sender<()>,
}

impl Daemon {
    /// Create a new daemon instance
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.get_config();

        let store = open_store(&config.storage.database_path)?;
        let authenticator = Arc::new(Authenticator::new(store.clone(), config.auth.bcrypt_cost));
        authenticator
            .ensure_user(&config.auth.default_username, &config.auth.default_password)
            .await?;

        tokio::fs::create_dir_all(&config.watcher.data_dir)
            .await
            .with_context(|| {
                format!("Failed to create data directory: {}", config.watcher.data_dir.display())
            })?;
        // Watch events carry the resolved path, so patterns and keys use it too
        let data_dir = tokio::fs::canonicalize(&config.watcher.data_dir).await?;
        let patterns = config_manager.get_patterns()?.with_root(&data_dir);

        let notifier = Notifier::new(config.server.event_buffer_size);
        let system_watcher = Arc::new(
            SystemWatcher::new(config.server.event_buffer_size)
                .with_context(|| "Failed to create system watcher")?,
        );
        let detector = Arc::new(ChangeDetector::new(store.clone()));
        let (pipeline, expired) = WatchPipeline::new(
            detector,
            notifier.clone(),
            Arc::new(patterns),
            config.watcher.pipeline_config(),
        );

        let metrics_collector = Arc::new(MetricsCollector::new());
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            config.auth.session_ttl_secs,
        )));

        let state = AppState {
            aggregator: Arc::new(Aggregator::new(store)),
            notifier: notifier.clone(),
            authenticator,
            sessions: Arc::clone(&sessions),
            metrics: Arc::clone(&metrics_collector),
            require_login: config.auth.require_login,
            login_redirect: config.auth.login_redirect.clone(),
        };
        let router = http::router(state, config.server.static_dir.as_deref());
        let http_server =
            HttpServer::new(&config.server.bind_address, config.server.port, router)?;

        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            config,
            data_dir,
            system_watcher,
            pipeline,
            expired: Some(expired),
            notifier,
            sessions,
            http_server,
            metrics_collector,
            shutdown_sender,
        })
    }

    /// Subscribe to accepted changes
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    /// Sender that stops a running daemon
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run the daemon until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the daemon until `signal` resolves or an internal shutdown is sent
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> Result<()> {
        info!("filetracker daemon starting...");
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        let expired = self
            .expired
            .take()
            .context("Daemon has already been started")?;

        let raw_events = self.system_watcher.subscribe();
        self.system_watcher
            .watch_directory(&self.data_dir, self.config.watcher.recursive)
            .with_context(|| format!("Failed to watch directory: {}", self.data_dir.display()))?;
        let pipeline_handle = self.pipeline.start(raw_events, expired);

        if self.config.watcher.scan_on_start {
            let queued = self
                .pipeline
                .scan(&self.data_dir, self.config.watcher.recursive)
                .await;
            info!("Startup scan queued {} files", queued);
        }

        let tasks = vec![self.start_metrics_collector(), self.start_session_purge()];

        if let Err(e) = self.http_server.start().await {
            pipeline_handle.shutdown();
            for task in tasks {
                task.abort();
            }
            return Err(e);
        }
        info!("filetracker daemon started, watching {}", self.data_dir.display());

        tokio::select! {
            _ = signal => {
                info!("Received shutdown signal");
            }
            _ = shutdown_receiver.recv() => {
                info!("Received internal shutdown signal");
            }
        }

        self.shutdown(pipeline_handle, tasks).await
    }

    fn start_metrics_collector(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics_collector);
        let system_watcher = Arc::clone(&self.system_watcher);
        let pipeline = Arc::clone(&self.pipeline);
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            loop {
                interval.tick().await;
                metrics.update_pipeline_stats(&pipeline.stats(), pipeline.pending());
                metrics.update_watcher_stats(&system_watcher.get_stats(), notifier.subscriber_count());
            }
        })
    }

    fn start_session_purge(&self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let purged = sessions.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired sessions", purged);
                }
            }
        })
    }

    /// Graceful shutdown
    async fn shutdown(self, pipeline: PipelineHandle, tasks: Vec<JoinHandle<()>>) -> Result<()> {
        info!("Starting graceful shutdown...");

        let _ = self.shutdown_sender.send(());
        pipeline.shutdown();
        for task in tasks {
            task.abort();
        }
        self.http_server.shutdown().await?;

        info!("Graceful shutdown completed");
        Ok(())
    }

    /// Get daemon statistics
    pub fn get_stats(&self) -> DaemonStats {
        DaemonStats {
            watcher_stats: self.system_watcher.get_stats(),
            pipeline_stats: self.pipeline.stats(),
            pending_timers: self.pipeline.pending(),
            subscribers: self.notifier.subscriber_count(),
            active_sessions: self.sessions.len(),
            metrics: self.metrics_collector.get_stats(),
        }
    }
}

/// Daemon statistics
#[derive(Debug, Clone)]
pub struct DaemonStats {
    pub watcher_stats: WatcherStats,
    pub pipeline_stats: PipelineStats,
    pub pending_timers: usize,
    pub subscribers: usize,
    pub active_sessions: usize,
    pub metrics: MetricsStats,
}
