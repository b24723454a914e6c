//! Configuration module for edge-echo.
//!
//! Supports both command-line arguments and an optional TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "edge-echo")]
#[command(author = "edge-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server on a shared epoll worker pool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (all interfaces by default)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads sharing the poller
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Set TCP_NODELAY on accepted connections
    #[arg(long)]
    pub nodelay: bool,

    /// Receive buffer capacity per read, in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Unsent echo bytes per connection before reading pauses
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Maximum readiness events returned by one wait
    #[arg(long)]
    pub max_events: Option<usize>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker pool configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            backlog: default_backlog(),
            nodelay: false,
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Receive buffer capacity per read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Pending echo bytes before the connection stops reading
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            max_pending: default_max_pending(),
        }
    }
}

/// Poller configuration
#[derive(Debug, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_workers() -> usize {
    2
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    2560
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_pending() -> usize {
    1024 * 1024 // 1 MB
}

fn default_max_events() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub backlog: i32,
    pub nodelay: bool,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub max_pending: usize,
    pub max_events: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
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

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            nodelay: cli.nodelay || toml_config.server.nodelay,
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.connection.max_connections),
            max_pending: cli
                .max_pending
                .unwrap_or(toml_config.connection.max_pending),
            max_events: cli.max_events.unwrap_or(toml_config.poll.max_events),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("workers", self.workers),
            ("buffer_size", self.buffer_size),
            ("max_events", self.max_events),
            ("max_connections", self.max_connections),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.max_events > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_events ({}) must not exceed {}",
                self.max_events,
                i32::MAX
            )));
        }
        if self.max_pending < self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "max_pending ({}) must be at least buffer_size ({})",
                self.max_pending, self.buffer_size
            )));
        }
        Ok(())
    }

    /// Listen address as `host:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.workers, 2);
        assert_eq!(config.buffer_size, 2560);
        assert_eq!(config.max_events, 1024);
        assert!(!config.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            workers = 4
            nodelay = true

            [connection]
            buffer_size = 4096
            max_pending = 65536

            [poll]
            max_events = 256

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.backlog, 1024);
        assert!(config.server.nodelay);
        assert_eq!(config.connection.buffer_size, 4096);
        assert_eq!(config.connection.max_connections, 10_000);
        assert_eq!(config.connection.max_pending, 65536);
        assert_eq!(config.poll.max_events, 256);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 7000\nworkers = 8").unwrap();
        let cli = CliArgs {
            port: Some(9100),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9100);
        assert_eq!(config.workers, 8);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validation() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            max_pending: 100,
            buffer_size: 2560,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // epoll_wait takes the batch size as a C int
        let config = Config {
            max_events: i32::MAX as usize + 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            max_events: i32::MAX as usize,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
