//! Configuration module for the ISO-8583 listener.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::runtime::{AllowList, FramingPolicy, PoolConfig};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

/// Command-line arguments for the listener
#[derive(Parser, Debug)]
#[command(name = "iso8583-listener")]
#[command(version = "0.1.0")]
#[command(about = "TCP listener for length-prefixed ISO-8583 messages", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Semicolon-separated list of permitted peer IPs
    #[arg(short = 'a', long)]
    pub allow_list: Option<String>,

    /// Worker pool core size
    #[arg(long)]
    pub core_threads: Option<String>,

    /// Worker pool maximum size
    #[arg(long)]
    pub max_threads: Option<String>,

    /// Seconds an idle non-core worker is kept
    #[arg(long)]
    pub keep_alive_secs: Option<String>,

    /// Worker pool queue capacity
    #[arg(long)]
    pub queue_len: Option<String>,

    /// Accumulate partial frame bodies across reads instead of dropping them
    #[arg(long)]
    pub reassemble_partial: bool,

    /// Where decoded messages go
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Built-in injection sinks selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Send every message back to its sender
    #[default]
    Echo,
    /// Log messages without replying
    Log,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub sink: SinkConfig,
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
    /// Semicolon-separated permitted peer IPs
    pub allow_list: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on the delay between bind attempts
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_list: None,
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

/// A pool sizing value as written by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Number(i64),
    Text(String),
}

impl Setting {
    fn parse(&self) -> Option<usize> {
        match self {
            Setting::Number(n) => usize::try_from(*n).ok(),
            Setting::Text(s) => s.trim().parse().ok(),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Setting::Text(s) if s.trim().is_empty())
    }
}

/// Worker pool sizing, all-or-nothing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolSettings {
    pub core_threads: Option<Setting>,
    pub max_threads: Option<Setting>,
    pub keep_alive_secs: Option<Setting>,
    pub queue_len: Option<Setting>,
}

impl PoolSettings {
    /// Resolve to a pool configuration.
    ///
    /// Defaults are used for every value unless all four are present and
    /// numeric. Non-numeric values are logged.
    pub fn resolve(&self) -> PoolConfig {
        let settings = [
            ("core_threads", &self.core_threads),
            ("max_threads", &self.max_threads),
            ("keep_alive_secs", &self.keep_alive_secs),
            ("queue_len", &self.queue_len),
        ];

        if settings
            .iter()
            .any(|(_, s)| s.as_ref().map_or(true, Setting::is_blank))
        {
            return PoolConfig::default();
        }

        let mut values = [0usize; 4];
        for (slot, (name, setting)) in values.iter_mut().zip(settings) {
            match setting.as_ref().and_then(Setting::parse) {
                Some(v) => *slot = v,
                None => {
                    error!(
                        setting = name,
                        value = ?setting,
                        "One of the properties of the worker pool is of an invalid type, using defaults"
                    );
                    return PoolConfig::default();
                }
            }
        }

        let [core_threads, max_threads, keep_alive_secs, queue_len] = values;
        PoolConfig {
            core_threads,
            max_threads,
            keep_alive: Duration::from_secs(keep_alive_secs as u64),
            queue_len,
        }
    }
}

/// Inbound framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    /// Body length assumed for a non-numeric header
    #[serde(default = "default_fallback_body_len")]
    pub fallback_body_len: usize,
    #[serde(default)]
    pub reassemble_partial: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            fallback_body_len: default_fallback_body_len(),
            reassemble_partial: false,
        }
    }
}

/// Injection sink selection
#[derive(Debug, Deserialize, Default)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
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
    8583
}

fn default_max_connections() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_fallback_body_len() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub allow_list: AllowList,
    pub pool: PoolConfig,
    pub framing: FramingPolicy,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub retry_backoff_max: Duration,
    pub sink: SinkKind,
    pub log_level: String,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config: None,
            host: None,
            port: None,
            allow_list: None,
            core_threads: None,
            max_threads: None,
            keep_alive_secs: None,
            queue_len: None,
            reassemble_partial: false,
            sink: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
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
        config.listen_addr()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let pool_overrides = PoolSettings {
            core_threads: cli.core_threads.map(Setting::Text),
            max_threads: cli.max_threads.map(Setting::Text),
            keep_alive_secs: cli.keep_alive_secs.map(Setting::Text),
            queue_len: cli.queue_len.map(Setting::Text),
        };
        let pool_settings = PoolSettings {
            core_threads: pool_overrides.core_threads.or(toml_config.pool.core_threads),
            max_threads: pool_overrides.max_threads.or(toml_config.pool.max_threads),
            keep_alive_secs: pool_overrides
                .keep_alive_secs
                .or(toml_config.pool.keep_alive_secs),
            queue_len: pool_overrides.queue_len.or(toml_config.pool.queue_len),
        };

        let allow_list = cli
            .allow_list
            .or(toml_config.server.allow_list)
            .map(|spec| AllowList::parse(&spec))
            .unwrap_or_default();

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            allow_list,
            pool: pool_settings.resolve(),
            framing: FramingPolicy {
                fallback_body_len: toml_config.framing.fallback_body_len,
                reassemble_partial: cli.reassemble_partial
                    || toml_config.framing.reassemble_partial,
            },
            max_connections: toml_config.server.max_connections,
            event_capacity: toml_config.server.event_capacity.max(1),
            retry_backoff_max: Duration::from_millis(toml_config.server.retry_backoff_max_ms),
            sink: cli.sink.unwrap_or(toml_config.sink.kind),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
            .map_err(|_| ConfigError::InvalidListenAddress(format!("{}:{}", self.host, self.port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Option<Setting> {
        Some(Setting::Text(s.to_string()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8583);
        assert!(config.server.allow_list.is_none());
        assert_eq!(config.framing.fallback_body_len, 100);
        assert_eq!(config.sink.kind, SinkKind::Echo);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            allow_list = "10.0.0.1;10.0.0.2"

            [pool]
            core_threads = 2
            max_threads = "8"
            keep_alive_secs = 30
            queue_len = 0

            [framing]
            reassemble_partial = true

            [sink]
            kind = "log"

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.port, 9000);
        assert_eq!(toml_config.pool.max_threads, text("8"));
        assert_eq!(toml_config.sink.kind, SinkKind::Log);

        let config = Config::merge(CliArgs::default(), toml_config);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert!(config.allow_list.permits("10.0.0.2".parse().unwrap()));
        assert!(!config.allow_list.permits("10.0.0.3".parse().unwrap()));
        assert_eq!(
            config.pool,
            PoolConfig {
                core_threads: 2,
                max_threads: 8,
                keep_alive: Duration::from_secs(30),
                queue_len: 0,
            }
        );
        assert!(config.framing.reassemble_partial);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 9000\n").unwrap();
        let cli = CliArgs::parse_from(["iso8583-listener", "--port", "7000", "--sink", "log"]);
        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.sink, SinkKind::Log);
    }

    #[test]
    fn test_pool_settings_all_or_nothing() {
        let partial = PoolSettings {
            core_threads: text("2"),
            max_threads: text("4"),
            keep_alive_secs: None,
            queue_len: text("10"),
        };
        assert_eq!(partial.resolve(), PoolConfig::default());
    }

    #[test]
    fn test_pool_settings_non_numeric_falls_back() {
        let bad = PoolSettings {
            core_threads: text("two"),
            max_threads: text("4"),
            keep_alive_secs: text("5"),
            queue_len: text("10"),
        };
        assert_eq!(bad.resolve(), PoolConfig::default());

        let negative = PoolSettings {
            core_threads: Some(Setting::Number(-1)),
            max_threads: text("4"),
            keep_alive_secs: text("5"),
            queue_len: text("10"),
        };
        assert_eq!(negative.resolve(), PoolConfig::default());
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.listen_addr(),
            Err(ConfigError::InvalidListenAddress(_))
        ));

        let config = Config {
            host: "[::1]".to_string(),
            port: 8583,
            ..Config::default()
        };
        assert_eq!(config.listen_addr().unwrap(), "[::1]:8583".parse().unwrap());
    }
}
