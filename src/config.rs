//! Configuration.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "drip-httpd")]
#[command(version = "0.1.0")]
#[command(about = "A minimal readiness-driven HTTP/1.1 server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog passed to the kernel
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Size of each buffer chunk in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum number of chunks kept in the free pool
    #[arg(long)]
    pub max_chunks: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_handlers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_handlers")]
    pub max_handlers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_handlers: default_max_handlers(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Size of each buffer chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum number of chunks kept in the free pool
    #[serde(default = "default_max_pooled_chunks")]
    pub max_pooled_chunks: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_pooled_chunks: default_max_pooled_chunks(),
        }
    }
}

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
    "127.0.0.1:8080".to_string()
}

fn default_backlog() -> u32 {
    1000
}

fn default_max_handlers() -> usize {
    1000
}

fn default_chunk_size() -> usize {
    4096
}

fn default_max_pooled_chunks() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub chunk_size: usize,
    pub max_pooled_chunks: usize,
    pub max_handlers: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Config {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.buffer.chunk_size),
            max_pooled_chunks: cli
                .max_chunks
                .unwrap_or(toml_config.buffer.max_pooled_chunks),
            max_handlers: cli
                .max_handlers
                .unwrap_or(toml_config.server.max_handlers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}
