//! Configuration module for the suffix-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::transform::DEFAULT_SUFFIX;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How replies are written back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SendMode {
    /// Keep writing until the whole reply is sent, retrying transient faults.
    Complete,
    /// One write per reply; short writes and transient faults drop the rest.
    SingleShot,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "suffix-echo")]
#[command(author = "suffix-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server that appends a suffix to every chunk", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of pending connections
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Text appended to every chunk (a newline follows it)
    #[arg(short = 's', long)]
    pub suffix: Option<String>,

    /// Reply write strategy
    #[arg(long, value_enum)]
    pub send_mode: Option<SendMode>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

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
    pub echo: EchoConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue depth
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Read timeout applied to accepted connections
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            idle_timeout_secs: None,
        }
    }
}

/// Reply configuration
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Maximum bytes read per recv
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_send_mode")]
    pub send_mode: SendMode,
    /// Consecutive transient send faults tolerated before closing
    #[serde(default = "default_send_retry_limit")]
    pub send_retry_limit: u32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            suffix: default_suffix(),
            chunk_size: default_chunk_size(),
            send_mode: default_send_mode(),
            send_retry_limit: default_send_retry_limit(),
        }
    }
}

/// Retry and backoff configuration
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    /// Socket creation attempts before giving up
    #[serde(default = "default_socket_attempts")]
    pub socket_attempts: u32,
    /// Base delay between socket creation attempts, doubled each time
    #[serde(default = "default_socket_backoff_ms")]
    pub socket_backoff_ms: u64,
    /// Pause after accept hits resource exhaustion
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            socket_attempts: default_socket_attempts(),
            socket_backoff_ms: default_socket_backoff_ms(),
            accept_backoff_ms: default_accept_backoff_ms(),
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
    "0.0.0.0:8080".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_suffix() -> String {
    DEFAULT_SUFFIX.to_string()
}

/// Largest accepted chunk_size; the read buffer is allocated up front.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

fn default_chunk_size() -> usize {
    1024
}

fn default_send_mode() -> SendMode {
    SendMode::Complete
}

fn default_send_retry_limit() -> u32 {
    8
}

fn default_socket_attempts() -> u32 {
    3
}

fn default_socket_backoff_ms() -> u64 {
    100
}

fn default_accept_backoff_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub idle_timeout: Option<Duration>,
    pub suffix: String,
    pub chunk_size: usize,
    pub send_mode: SendMode,
    pub send_retry_limit: u32,
    pub socket_attempts: u32,
    pub socket_backoff: Duration,
    pub accept_backoff: Duration,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen address '{listen_str}'")))?;
        if !listen.is_ipv4() {
            return Err(ConfigError::Invalid(format!(
                "listen address '{listen}' is not IPv4"
            )));
        }

        let backlog = cli.backlog.unwrap_or(toml_config.server.backlog);
        if backlog <= 0 {
            return Err(ConfigError::Invalid(format!("backlog {backlog}")));
        }

        let chunk_size = toml_config.echo.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {chunk_size} (must be 1..={MAX_CHUNK_SIZE})"
            )));
        }

        let socket_attempts = toml_config.retry.socket_attempts;
        if socket_attempts == 0 {
            return Err(ConfigError::Invalid("socket_attempts 0".to_string()));
        }

        let idle_timeout = match cli.idle_timeout.or(toml_config.server.idle_timeout_secs) {
            // zero disables the timeout, same as leaving it unset
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Config {
            listen,
            backlog,
            idle_timeout,
            suffix: cli.suffix.unwrap_or(toml_config.echo.suffix),
            chunk_size,
            send_mode: cli.send_mode.unwrap_or(toml_config.echo.send_mode),
            send_retry_limit: toml_config.echo.send_retry_limit,
            socket_attempts,
            socket_backoff: Duration::from_millis(toml_config.retry.socket_backoff_ms),
            accept_backoff: Duration::from_millis(toml_config.retry.accept_backoff_ms),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: default_backlog(),
            idle_timeout: None,
            suffix: default_suffix(),
            chunk_size: default_chunk_size(),
            send_mode: default_send_mode(),
            send_retry_limit: default_send_retry_limit(),
            socket_attempts: default_socket_attempts(),
            socket_backoff: Duration::from_millis(default_socket_backoff_ms()),
            accept_backoff: Duration::from_millis(default_accept_backoff_ms()),
            log_level: default_log_level(),
        }
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
            ConfigError::Invalid(what) => write!(f, "Invalid configuration: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.backlog, 10);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.suffix, " Received");
        assert_eq!(config.send_mode, SendMode::Complete);
        assert_eq!(config.socket_attempts, 3);
        assert_eq!(config.accept_backoff, Duration::from_secs(1));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            backlog = 64
            idle_timeout_secs = 30

            [echo]
            suffix = " Ack"
            chunk_size = 512
            send_mode = "single-shot"

            [retry]
            socket_attempts = 5
            socket_backoff_ms = 10
            accept_backoff_ms = 250

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.backlog, 64);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.suffix, " Ack");
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.send_mode, SendMode::SingleShot);
        assert_eq!(config.socket_attempts, 5);
        assert_eq!(config.socket_backoff, Duration::from_millis(10));
        assert_eq!(config.accept_backoff, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "suffix-echo",
            "--listen",
            "127.0.0.1:7000",
            "--send-mode",
            "single-shot",
            "--log-level",
            "trace",
        ]);

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.send_mode, SendMode::SingleShot);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_rejects_ipv6_listen() {
        let cli = CliArgs {
            listen: Some("[::1]:8080".to_string()),
            ..CliArgs::default()
        };
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let toml_config: TomlConfig = toml::from_str("[echo]\nchunk_size = 0\n").unwrap();
        assert!(Config::merge(CliArgs::default(), toml_config).is_err());
    }

    #[test]
    fn test_rejects_oversized_chunk_size() {
        let toml_config: TomlConfig =
            toml::from_str("[echo]\nchunk_size = 9223372036854775807\n").unwrap();
        let err = Config::merge(CliArgs::default(), toml_config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let toml_config: TomlConfig = toml::from_str("[echo]\nchunk_size = 65536\n").unwrap();
        let config = Config::merge(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let cli = CliArgs {
            idle_timeout: Some(0),
            ..CliArgs::default()
        };
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert!(config.idle_timeout.is_none());
    }
}
