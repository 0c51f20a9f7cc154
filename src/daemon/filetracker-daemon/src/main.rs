//! filetracker - JSON directory watcher and aggregation server

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use filetracker_core::SqliteStore;
use filetracker_daemon::auth::Authenticator;
use filetracker_daemon::{ConfigManager, Daemon, DaemonConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// filetracker - JSON directory watcher
#[derive(Parser)]
#[command(name = "filetracker")]
#[command(about = "Watches a directory of JSON files and serves their aggregate")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start(StartArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
    /// Create a user or reset its password
    User(UserArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "filetracker.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Override bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the watched directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = "filetracker.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long, default_value = "filetracker.toml")]
    output: PathBuf,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct UserArgs {
    username: String,
    password: String,

    /// Configuration file naming the database
    #[arg(short, long, default_value = "filetracker.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start_daemon(args).await,
        Commands::Validate(args) => validate_config(args),
        Commands::Config(args) => generate_config(args).await,
        Commands::User(args) => set_user(args).await,
    }
}

fn load_config(path: &Path) -> Result<ConfigManager> {
    let mut config_manager = ConfigManager::new();
    if path.exists() {
        config_manager
            .load_from_file(path)
            .with_context(|| "Failed to load configuration")?;
    } else {
        config_manager.load_from_env()?;
    }
    Ok(config_manager)
}

/// Start the filetracker daemon
async fn start_daemon(args: StartArgs) -> Result<()> {
    let mut config_manager = load_config(&args.config)?;

    let config = config_manager.config_mut();
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.watcher.data_dir = data_dir;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    let config = config_manager.get_config();
    init_tracing(&config)?;
    info!("Starting filetracker v{}", env!("CARGO_PKG_VERSION"));
    if config_manager.config_path().is_none() {
        warn!("Configuration file not found, using defaults");
    }

    ConfigManager::validate(&config)?;

    if config.server.enable_metrics {
        init_metrics(&config)?;
    }

    let daemon = Daemon::new(config_manager).await?;
    daemon.run().await
}

/// Validate configuration file
fn validate_config(args: ValidateArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config)?;

    let config = config_manager.get_config();
    ConfigManager::validate(&config)?;
    config_manager.get_patterns()?;

    println!("✓ Configuration is valid");
    Ok(())
}

/// Generate default configuration file
async fn generate_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "Configuration file already exists: {}",
            args.output.display()
        );
    }

    ConfigManager::new().save_to_file(&args.output).await?;

    println!("Generated configuration file: {}", args.output.display());
    Ok(())
}

/// Create or update a login
async fn set_user(args: UserArgs) -> Result<()> {
    let config = load_config(&args.config)?.get_config();

    let store = SqliteStore::open(&config.storage.database_path).with_context(|| {
        format!("Failed to open {}", config.storage.database_path.display())
    })?;
    let authenticator = Authenticator::new(Arc::new(store), config.auth.bcrypt_cost);
    authenticator
        .set_password(&args.username, &args.password)
        .await?;

    println!("Saved user '{}'", args.username);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &DaemonConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.logging.format.as_str() {
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?,
        _ => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    Ok(())
}

/// Initialize Prometheus metrics
fn init_metrics(config: &DaemonConfig) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.server.metrics_port))
        .install()?;

    info!(
        "Metrics endpoint started on port {}",
        config.server.metrics_port
    );
    Ok(())
}
