//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echoserve")]
#[command(author = "echoserve authors")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-pattern TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Wrap every connection in TLS
    #[arg(long)]
    pub tls: bool,

    /// Path to the PEM-encoded server certificate chain
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to the PEM-encoded server private key
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Number of worker threads (0 = number of CPU cores)
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
    pub tls: TlsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending-connection backlog handed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Transport security configuration
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    /// Wrap every connection in TLS
    #[serde(default)]
    pub enabled: bool,
    /// PEM-encoded certificate chain
    pub cert: Option<PathBuf>,
    /// PEM-encoded private key
    pub key: Option<PathBuf>,
}

/// Event-loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Boss (acceptor) threads
    #[serde(default = "default_boss_threads")]
    pub boss_threads: usize,
    /// Worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub worker_threads: usize,
    /// Accepts performed per readiness event before yielding
    #[serde(default = "default_accept_batch")]
    pub accept_batch: usize,
    /// Read buffer size per worker in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum concurrent connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            boss_threads: default_boss_threads(),
            worker_threads: 0,
            accept_batch: default_accept_batch(),
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
        }
    }
}

/// Graceful shutdown timing
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds each worker may spend flushing in-flight I/O
    #[serde(default = "default_quiet_period")]
    pub quiet_period_secs: u64,
    /// Seconds to wait for worker threads to exit
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            quiet_period_secs: default_quiet_period(),
            timeout_secs: default_shutdown_timeout(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8007
}

fn default_backlog() -> u32 {
    100
}

fn default_boss_threads() -> usize {
    1
}

fn default_accept_batch() -> usize {
    16
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_max_connections() -> usize {
    10240
}

fn default_quiet_period() -> u64 {
    2
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub boss_threads: usize,
    pub worker_threads: usize,
    pub accept_batch: usize,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub shutdown_quiet_period_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
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

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            tls: cli.tls || toml_config.tls.enabled,
            tls_cert: cli.tls_cert.or(toml_config.tls.cert),
            tls_key: cli.tls_key.or(toml_config.tls.key),
            boss_threads: toml_config.runtime.boss_threads,
            worker_threads: cli.workers.unwrap_or(toml_config.runtime.worker_threads),
            accept_batch: toml_config.runtime.accept_batch,
            buffer_size: toml_config.runtime.buffer_size,
            max_connections: toml_config.runtime.max_connections,
            shutdown_quiet_period_secs: toml_config.shutdown.quiet_period_secs,
            shutdown_timeout_secs: toml_config.shutdown.timeout_secs,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(ConfigError::Invalid(
                "tls enabled but tls_cert/tls_key not set".to_string(),
            ));
        }
        if self.accept_batch == 0 {
            return Err(ConfigError::Invalid(
                "accept_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker thread count with 0 resolved to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.worker_threads
        }
    }

    pub fn shutdown_quiet_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_quiet_period_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
