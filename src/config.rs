//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::buffer::{LineBufferConfig, OverflowPolicy};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented chat relay with broadcast and whisper", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous clients
    #[arg(short = 'n', long)]
    pub max_clients: Option<usize>,

    /// Runtime to serve connections with
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Per-connection line buffer size in bytes (one byte is reserved)
    #[arg(long)]
    pub line_capacity: Option<usize>,

    /// Maximum display name length in bytes
    #[arg(long)]
    pub max_name_len: Option<usize>,

    /// What to do with lines longer than the line buffer
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which event loop drives the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single-threaded readiness loop on mio (epoll/kqueue).
    Mio,
    /// Coordinator task plus per-connection tasks on a current-thread tokio runtime.
    Actor,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of simultaneous clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            runtime: default_runtime(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Line buffer size in bytes, terminator byte included
    #[serde(default = "default_line_capacity")]
    pub line_capacity: usize,
    /// Maximum display name length in bytes
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            line_capacity: default_line_capacity(),
            max_name_len: default_max_name_len(),
            overflow: default_overflow(),
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
    "127.0.0.1:9555".to_string()
}

fn default_max_clients() -> usize {
    16
}

fn default_backlog() -> i32 {
    10
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_line_capacity() -> usize {
    256
}

fn default_max_name_len() -> usize {
    49
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::Truncate
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_clients: usize,
    pub backlog: i32,
    pub runtime: RuntimeType,
    pub line_capacity: usize,
    pub max_name_len: usize,
    pub overflow: OverflowPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["chat-relay"]), TomlConfig::default())
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            backlog: toml_config.server.backlog,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            line_capacity: cli
                .line_capacity
                .unwrap_or(toml_config.protocol.line_capacity),
            max_name_len: cli
                .max_name_len
                .unwrap_or(toml_config.protocol.max_name_len),
            overflow: cli.overflow.unwrap_or(toml_config.protocol.overflow),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1"));
        }
        if self.line_capacity < 2 {
            return Err(ConfigError::Invalid("line_capacity must be at least 2"));
        }
        if self.max_name_len == 0 {
            return Err(ConfigError::Invalid("max_name_len must be at least 1"));
        }
        Ok(())
    }

    /// Line buffer settings for every connection.
    pub fn line_buffer(&self) -> LineBufferConfig {
        LineBufferConfig {
            capacity: self.line_capacity,
            policy: self.overflow,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
