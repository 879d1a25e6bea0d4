//! Configuration for the testbed server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The engine
//! selection is the one mandatory setting; everything else defaults.

use crate::engine::Engine;
use clap::Parser;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the testbed server
#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(version = "0.1.0")]
#[command(about = "Comparative TCP server architectures over one tiny protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Engine to run (iterative, multiplex, pool, threadpool)
    #[arg(short, long)]
    pub engine: Option<Engine>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Worker threads for the pool engine (0 = one per core)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Client table size for the multiplex engine
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Timing log path
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Truncate the timing log instead of appending
    #[arg(long)]
    pub truncate_csv: bool,

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
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Engine to run
    pub engine: Option<String>,
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Worker threads for the pool engine (0 = one per core)
    #[serde(default)]
    pub workers: usize,
    /// Client table size for the multiplex engine
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: None,
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: 0,
            max_clients: default_max_clients(),
        }
    }
}

/// Timing log configuration
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    /// Timing log path
    #[serde(default = "default_csv")]
    pub csv: PathBuf,
    /// Truncate the timing log instead of appending
    #[serde(default)]
    pub truncate: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            csv: default_csv(),
            truncate: false,
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
    5000
}

fn default_backlog() -> u32 {
    5
}

fn default_max_clients() -> usize {
    10
}

fn default_csv() -> PathBuf {
    PathBuf::from("states.csv")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub workers: usize,
    pub max_clients: usize,
    pub csv: PathBuf,
    pub truncate_csv: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let engine = match cli.engine {
            Some(engine) => engine,
            None => match toml_config.server.engine {
                Some(ref name) => name.parse().map_err(ConfigError::InvalidEngine)?,
                None => return Err(ConfigError::MissingEngine),
            },
        };

        Ok(Config {
            engine,
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            csv: cli.csv.unwrap_or(toml_config.timing.csv),
            truncate_csv: cli.truncate_csv || toml_config.timing.truncate,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Socket address the listener binds.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidEngine(String),
    MissingEngine,
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
            ConfigError::InvalidEngine(msg) => write!(f, "{msg}"),
            ConfigError::MissingEngine => {
                write!(
                    f,
                    "No engine selected: pass --engine or set engine in the config file"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
