//! Configuration management
//! Follows SRP: Only handles configuration loading and validation
//!
//! Sources are layered: built-in defaults, then the TOML file, then
//! `FILETRACKER__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use filetracker_system::{PathFilter, PipelineConfig};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

const ENV_PREFIX: &str = "FILETRACKER";

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub watcher: WatcherConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub patterns: PatternConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
    /// Enable Prometheus metrics endpoint
    pub enable_metrics: bool,
    /// Metrics port
    pub metrics_port: u16,
    /// Directory served for GET requests no route matches
    pub static_dir: Option<PathBuf>,
    /// Capacity of the change broadcast channel
    pub event_buffer_size: usize,
}

/// File watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directory of JSON files to watch
    pub data_dir: PathBuf,
    pub recursive: bool,
    /// Per-path debounce quiet period in milliseconds
    pub debounce_ms: u64,
    /// Feed files already present at startup through the pipeline
    pub scan_on_start: bool,
    /// Remove store records of deleted files
    pub prune_deleted: bool,
}

/// Persistent storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; `:memory:` keeps state in process only
    pub database_path: PathBuf,
}

/// Login configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject data, export and event requests without a session
    pub require_login: bool,
    /// User seeded at startup if absent
    pub default_username: String,
    pub default_password: String,
    pub bcrypt_cost: u32,
    pub session_ttl_secs: u64,
    /// Where a successful login redirects to
    pub login_redirect: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

/// File pattern configuration, matched against paths relative to `data_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Patterns to include (glob format)
    pub include: Vec<String>,
    /// Patterns to exclude (glob format)
    pub exclude: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
            enable_metrics: false,
            metrics_port: 9091,
            static_dir: None,
            event_buffer_size: 1024,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/json_files"),
            recursive: true,
            debounce_ms: 1000,
            scan_on_start: true,
            prune_deleted: false,
        }
    }
}

impl WatcherConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            quiet_period: Duration::from_millis(self.debounce_ms),
            prune_deleted: self.prune_deleted,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("fileTracker.db"),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_login: true,
            default_username: "admin".to_string(),
            default_password: "admin123".to_string(),
            bcrypt_cost: 10,
            session_ttl_secs: 24 * 60 * 60,
            login_redirect: "/dashboard".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*.json".to_string()],
            exclude: vec!["**/.*".to_string(), "**/.*/**".to_string()],
        }
    }
}

/// Compiled pattern matcher for performance
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    include: GlobSet,
    exclude: GlobSet,
    root: Option<PathBuf>,
}

impl CompiledPatterns {
    pub fn new(config: &PatternConfig) -> Result<Self> {
        Ok(Self {
            include: build_set(&config.include, "include")?,
            exclude: build_set(&config.exclude, "exclude")?,
            root: None,
        })
    }

    /// Match paths relative to `root` when they lie under it
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Check if a file should be watched based on patterns
    pub fn should_watch(&self, path: &Path) -> bool {
        let relative = self
            .root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        let path_str = relative.to_string_lossy();

        // Check include patterns first
        if !self.include.is_match(&*path_str) {
            return false;
        }

        // Check exclude patterns
        !self.exclude.is_match(&*path_str)
    }
}

impl PathFilter for CompiledPatterns {
    fn should_watch(&self, path: &Path) -> bool {
        CompiledPatterns::should_watch(self, path)
    }
}

fn build_set(patterns: &[String], kind: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid {} pattern: {}", kind, pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Configuration manager
pub struct ConfigManager {
    config: DaemonConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a new configuration manager holding the defaults
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
            config_path: None,
        }
    }

    /// Load configuration from file, with environment overrides on top
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.config = Self::layered(Some(path))
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        self.config_path = Some(path.to_path_buf());

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Apply environment overrides to the defaults, without a file
    pub fn load_from_env(&mut self) -> Result<()> {
        self.config = Self::layered(None).context("Failed to read environment overrides")?;
        Ok(())
    }

    fn layered(path: Option<&Path>) -> Result<DaemonConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(&self.config)?;

        tokio::fs::write(path.as_ref(), config_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        info!("Saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    /// Get current configuration
    pub fn get_config(&self) -> DaemonConfig {
        self.config.clone()
    }

    /// Mutable access for command-line overrides
    pub fn config_mut(&mut self) -> &mut DaemonConfig {
        &mut self.config
    }

    /// File the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Get compiled patterns
    pub fn get_patterns(&self) -> Result<CompiledPatterns> {
        CompiledPatterns::new(&self.config.patterns)
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        // Validate server config
        if config.server.port == 0 {
            anyhow::bail!("Invalid server port: {}", config.server.port);
        }

        if config.server.event_buffer_size == 0 {
            anyhow::bail!("event_buffer_size must be > 0");
        }

        // Validate watcher config
        if config.watcher.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }

        if config.watcher.debounce_ms == 0 {
            anyhow::bail!("debounce_ms must be > 0");
        }

        // Validate auth config
        if !(4..=31).contains(&config.auth.bcrypt_cost) {
            anyhow::bail!(
                "bcrypt_cost must be between 4 and 31, got {}",
                config.auth.bcrypt_cost
            );
        }

        if config.auth.default_username.is_empty() {
            anyhow::bail!("default_username must not be empty");
        }

        // Validate patterns
        CompiledPatterns::new(&config.patterns)?;

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
