//! Configuration module for the memcached-lite server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments (and the `HOST`/`PORT` environment variables) take
//! precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What a session does with a line it cannot interpret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Drop the line without replying
    #[default]
    Silent,
    /// Reply `ERROR\r\n`
    Error,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "memcached-lite")]
#[command(version)]
#[command(about = "A memcached-inspired key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Path of the JSON store document
    #[arg(short, long)]
    pub store_path: Option<PathBuf>,

    /// Suppress the greeting banner (memcache server mode)
    #[arg(short, long, alias = "memcache")]
    pub quiet: bool,

    /// Upper bound in milliseconds of the random pause inside the store lock
    #[arg(long)]
    pub max_delay_ms: Option<u64>,

    /// Disable the random pause inside the store lock
    #[arg(long, conflicts_with = "max_delay_ms")]
    pub no_delay: bool,

    /// What to do with malformed command lines
    #[arg(long, value_enum)]
    pub on_malformed: Option<MalformedPolicy>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Send the greeting banner on connect
    #[serde(default = "default_greeting")]
    pub greeting: bool,
    #[serde(default)]
    pub on_malformed: MalformedPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            greeting: default_greeting(),
            on_malformed: MalformedPolicy::default(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Path of the JSON store document
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Upper bound of the critical-section pause in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    3000
}

fn default_greeting() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("kvstore.json")
}

fn default_max_delay_ms() -> u64 {
    999
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store_path: PathBuf,
    pub greeting: bool,
    pub max_delay: Duration,
    pub on_malformed: MalformedPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let max_delay_ms = if cli.no_delay {
            0
        } else {
            cli.max_delay_ms
                .unwrap_or(toml_config.storage.max_delay_ms)
        };

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            store_path: cli.store_path.unwrap_or(toml_config.storage.path),
            greeting: !cli.quiet && toml_config.server.greeting,
            max_delay: Duration::from_millis(max_delay_ms),
            on_malformed: cli
                .on_malformed
                .unwrap_or(toml_config.server.on_malformed),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CliArgs {
    /// Arguments as if none were given on the command line.
    fn default_args() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            store_path: None,
            quiet: false,
            max_delay_ms: None,
            no_delay: false,
            on_malformed: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
