//! Configuration
//!
//! Layered loading: built-in defaults, then system file, then user file,
//! then an explicit `--config` file, then `VITALINK_`-prefixed environment
//! variables, then command-line overrides.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vitalink")]
#[command(about = "Patient vital-sign streaming monitor")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Database URL
    #[arg(short, long)]
    pub database_url: Option<String>,

    /// MQTT broker host
    #[arg(long)]
    pub broker_host: Option<String>,

    /// WebSocket listen address
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Supported subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the monitoring service
    Run,
    /// Print a default configuration file
    ResetConfig,
}

/// Log level.
#[derive(clap::ValueEnum, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub aggregation: AggregationConfig,
    pub logging: LoggingConfig,
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Connect timeout in seconds
    pub connect_timeout: u64,
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Credentials are applied only when both are present.
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Consecutive connection errors tolerated before the worker gives up.
    pub max_retries: u32,
    /// First reconnect delay; doubles per attempt up to a fixed ceiling.
    pub backoff_base_ms: u64,
}

/// WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for client connections
    pub bind: SocketAddr,
    /// Outbound dispatch queue capacity
    pub dispatch_queue: usize,
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Seconds between buffer flushes
    pub interval_secs: u64,
    /// Also persist every raw sample to record_sensor_data
    pub persist_raw_history: bool,
    /// Raw-history queue capacity
    pub raw_queue: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// When set, logs additionally roll daily into this directory.
    pub directory: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Full,
    Json,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:vitalink.db".to_string(),
            max_connections: 5,
            connect_timeout: 30,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "vitalink-monitor".to_string(),
            max_retries: 10,
            backoff_base_ms: 500,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9001".parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 9001))
            }),
            dispatch_queue: 256,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            persist_raw_history: false,
            raw_queue: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            directory: None,
        }
    }
}

impl Config {
    /// Load from every configuration source.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Self::load_with_cli(cli)
    }

    /// Load with pre-parsed CLI arguments.
    pub fn load_with_cli(cli: Cli) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        if let Some(system_config) = Self::get_system_config_path() {
            if system_config.exists() {
                builder = builder.add_source(File::from(system_config));
            }
        }

        if let Some(user_config) = Self::get_user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(File::from(user_config));
            }
        }

        if let Some(config_path) = cli.config {
            if config_path.exists() {
                builder = builder.add_source(File::from(config_path));
            } else {
                return Err(anyhow!(
                    "configuration file not found: {}",
                    config_path.display()
                ));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("VITALINK")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;

        if let Some(log_level) = cli.log_level {
            config.logging.level = log_level;
        }
        if let Some(database_url) = cli.database_url {
            config.database.url = database_url;
        }
        if let Some(broker_host) = cli.broker_host {
            config.broker.host = broker_host;
        }
        if let Some(bind) = cli.bind {
            config.server.bind = bind;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn get_system_config_path() -> Option<PathBuf> {
        Some(PathBuf::from("/etc/vitalink/config.toml"))
    }

    pub fn get_user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "vitalink").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Render the default configuration as TOML.
    pub fn generate_default_config() -> Result<String> {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("failed to render default config: {e}"))
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(anyhow!("database URL must not be empty"));
        }
        if self.broker.host.is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }
        if self.aggregation.interval_secs == 0 {
            return Err(anyhow!("aggregation interval must be at least one second"));
        }
        if self.server.dispatch_queue == 0 {
            return Err(anyhow!("dispatch queue capacity must be non-zero"));
        }
        if let Some(log_dir) = &self.logging.directory {
            if !log_dir.exists() {
                std::fs::create_dir_all(log_dir)?;
            }
        }
        Ok(())
    }

    /// Install the tracing subscriber.
    pub fn init_logging(&self) -> Result<()> {
        let level_filter = EnvFilter::builder()
            .with_default_directive(Level::from(self.logging.level.clone()).into())
            .from_env_lossy();

        match self.logging.format {
            LogFormat::Compact => {
                let fmt_layer = fmt::layer().compact();
                if let Some(log_dir) = &self.logging.directory {
                    std::fs::create_dir_all(log_dir)?;
                    let file_appender = tracing_appender::rolling::daily(log_dir, "vitalink.log");
                    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
                    let file_layer = fmt::layer()
                        .compact()
                        .with_ansi(false)
                        .with_writer(non_blocking);
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .with(file_layer)
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .init();
                }
            }
            LogFormat::Full => {
                let fmt_layer = fmt::layer();
                if let Some(log_dir) = &self.logging.directory {
                    std::fs::create_dir_all(log_dir)?;
                    let file_appender = tracing_appender::rolling::daily(log_dir, "vitalink.log");
                    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
                    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .with(file_layer)
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .init();
                }
            }
            LogFormat::Json => {
                let fmt_layer = fmt::layer().with_target(true).with_level(true);
                if let Some(log_dir) = &self.logging.directory {
                    std::fs::create_dir_all(log_dir)?;
                    let file_appender = tracing_appender::rolling::daily(log_dir, "vitalink.log");
                    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
                    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .with(file_layer)
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(level_filter)
                        .with(fmt_layer)
                        .init();
                }
            }
        }

        tracing::info!(level = ?self.logging.level, "logging initialized");
        Ok(())
    }
}
