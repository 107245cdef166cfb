//! Configuration module for the relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "name-relay")]
#[command(author = "name-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A username-addressed TCP message relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum concurrent connections from a single source address
    #[arg(long)]
    pub max_connections_per_address: Option<usize>,

    /// Maximum content frame payload in bytes
    #[arg(long)]
    pub max_content_size: Option<u32>,

    /// Handshake read timeout in milliseconds
    #[arg(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// Idle read timeout in seconds
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Forward write timeout in milliseconds
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Protocol and admission limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections_per_address")]
    pub max_connections_per_address: usize,
    #[serde(default = "default_max_content_size")]
    pub max_content_size: u32,
    /// Bytes the frame reader may skip looking for a marker before giving up
    #[serde(default = "default_max_resync_bytes")]
    pub max_resync_bytes: usize,
    /// Width of the space-padded username field sent at handshake
    #[serde(default = "default_handshake_size")]
    pub handshake_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_address: default_max_connections_per_address(),
            max_content_size: default_max_content_size(),
            max_resync_bytes: default_max_resync_bytes(),
            handshake_size: default_handshake_size(),
        }
    }
}

/// Read and write deadlines
#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            idle_secs: default_idle_secs(),
            write_ms: default_write_ms(),
        }
    }
}

/// Reporting cycle configuration
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_max_connections_per_address() -> usize {
    200_000
}

fn default_max_content_size() -> u32 {
    101_000
}

fn default_max_resync_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_handshake_size() -> usize {
    136
}

fn default_handshake_ms() -> u64 {
    1000
}

fn default_idle_secs() -> u64 {
    60
}

fn default_write_ms() -> u64 {
    1000
}

fn default_report_interval_secs() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections_per_address: usize,
    pub max_content_size: u32,
    pub max_resync_bytes: usize,
    pub handshake_size: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub report_interval: Duration,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_parts(CliArgs::parse_from(["name-relay"]), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::from_parts(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections_per_address: cli
                .max_connections_per_address
                .unwrap_or(toml_config.limits.max_connections_per_address),
            max_content_size: cli
                .max_content_size
                .unwrap_or(toml_config.limits.max_content_size),
            max_resync_bytes: toml_config.limits.max_resync_bytes,
            handshake_size: toml_config.limits.handshake_size,
            handshake_timeout: Duration::from_millis(
                cli.handshake_timeout_ms
                    .unwrap_or(toml_config.timeouts.handshake_ms),
            ),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout_secs.unwrap_or(toml_config.timeouts.idle_secs),
            ),
            write_timeout: Duration::from_millis(
                cli.write_timeout_ms.unwrap_or(toml_config.timeouts.write_ms),
            ),
            report_interval: Duration::from_secs(toml_config.metrics.report_interval_secs),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_size == 0 {
            return Err(ConfigError::Invalid("handshake_size must be at least 1"));
        }
        if self.max_content_size == 0 {
            return Err(ConfigError::Invalid("max_content_size must be at least 1"));
        }
        if self.max_connections_per_address == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_address must be at least 1",
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be at least 1"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout_secs must be at least 1"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("write_timeout_ms must be at least 1"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid("report_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// Worker thread count, falling back to available parallelism.
    pub fn worker_threads(&self) -> usize {
        self.workers.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
