//! Configuration module for the flowgrind daemon.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::acl::{AccessControlList, AclError};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the daemon
#[derive(Parser, Debug)]
#[command(name = "flowgrindd")]
#[command(version)]
#[command(about = "Flowgrind measurement daemon", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind the control listener to
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Control listener port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Add address to the list of allowed hosts (CIDR syntax, repeatable)
    #[arg(short = 'a', long = "allow", value_name = "ADDRESS[/PREFIX]")]
    pub allow: Vec<String>,

    /// Increase debug verbosity (repeatable)
    #[arg(short = 'D', long = "debug", action = ArgAction::Count)]
    pub debug: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Event loop poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Seconds to wait for a session proposal (0 = wait forever)
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,

    /// Largest read or write block a client may request, in bytes
    #[arg(long)]
    pub max_block_size: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Allowed hosts
#[derive(Debug, Deserialize, Default)]
pub struct AclConfig {
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Per-session tuning
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
    /// Reply blocks buffered for a congested control connection
    #[serde(default = "default_reply_queue")]
    pub reply_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_block_size: default_max_block_size(),
            reply_queue: default_reply_queue(),
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

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5999
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_block_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_reply_queue() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Most reply blocks a session may hold back for its control connection.
const MAX_REPLY_QUEUE: usize = 65536;

/// Settings every session worker needs. Immutable once built.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub handshake_timeout: Option<Duration>,
    pub max_block_size: usize,
    pub reply_queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionConfig::default().into()
    }
}

impl From<SessionConfig> for SessionSettings {
    fn from(cfg: SessionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            handshake_timeout: match cfg.handshake_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_block_size: cfg.max_block_size,
            reply_queue: cfg.reply_queue.clamp(1, MAX_REPLY_QUEUE),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub acl: AccessControlList,
    pub session: SessionSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let bind = cli.bind.unwrap_or(toml_config.server.bind);
        let ip: IpAddr = bind
            .parse()
            .map_err(|_| ConfigError::BindAddress(bind.clone()))?;
        let port = cli.port.unwrap_or(toml_config.server.port);

        // Entries from the file first, then the command line.
        let mut allow = toml_config.acl.allow;
        allow.extend(cli.allow);
        let acl = AccessControlList::parse(&allow).map_err(ConfigError::Acl)?;

        let mut session = toml_config.session;
        if let Some(ms) = cli.poll_interval_ms {
            session.poll_interval_ms = ms;
        }
        if let Some(secs) = cli.handshake_timeout_secs {
            session.handshake_timeout_secs = secs;
        }
        if let Some(max) = cli.max_block_size {
            session.max_block_size = max;
        }

        let log_level = match cli.debug {
            0 => cli.log_level.unwrap_or(toml_config.logging.level),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };

        Ok(Config {
            listen: SocketAddr::new(ip, port),
            acl,
            session: session.into(),
            log_level,
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BindAddress(String),
    Acl(AclError),
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
            ConfigError::BindAddress(addr) => write!(f, "Invalid bind address '{addr}'"),
            ConfigError::Acl(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("flowgrindd").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:5999".parse().unwrap());
        assert!(config.acl.is_empty());
        assert_eq!(config.session.poll_interval, Duration::from_millis(100));
        assert_eq!(config.session.handshake_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.session.max_block_size, 16 * 1024 * 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            bind = "::"
            port = 6000

            [acl]
            allow = ["10.0.0.0/8", "2001:db8::/32"]

            [session]
            poll_interval_ms = 50
            handshake_timeout_secs = 0
            max_block_size = 65536

            [logging]
            level = "warn"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.listen, "[::]:6000".parse().unwrap());
        assert_eq!(config.acl.len(), 2);
        assert_eq!(config.session.poll_interval, Duration::from_millis(50));
        assert_eq!(config.session.handshake_timeout, None);
        assert_eq!(config.session.max_block_size, 65536);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 6000
            [acl]
            allow = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        let args = cli(&["-p", "7000", "-a", "192.168.0.0/16", "-D", "--poll-interval-ms", "20"]);
        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.acl.len(), 2);
        assert!(config.acl.is_allowed("192.168.3.4".parse().unwrap()));
        assert_eq!(config.session.poll_interval, Duration::from_millis(20));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_reply_queue_is_bounded() {
        let huge: TomlConfig = toml::from_str(&format!(
            "[session]\nreply_queue = {}\n",
            i64::MAX
        ))
        .unwrap();
        let config = Config::merge(cli(&[]), huge).unwrap();
        assert_eq!(config.session.reply_queue, MAX_REPLY_QUEUE);

        let zero: TomlConfig = toml::from_str("[session]\nreply_queue = 0\n").unwrap();
        let config = Config::merge(cli(&[]), zero).unwrap();
        assert_eq!(config.session.reply_queue, 1);
    }

    #[test]
    fn test_debug_flag_escalates_to_trace() {
        let config = Config::merge(cli(&["-DD"]), TomlConfig::default()).unwrap();
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_bad_acl_entry_is_fatal() {
        let err = Config::merge(cli(&["-a", "10.0.0.0/40"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Acl(AclError::BadPrefix { .. })));
    }

    #[test]
    fn test_bad_bind_address_is_fatal() {
        let err = Config::merge(cli(&["-b", "localhost"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::BindAddress(_)));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_args(cli(&["-c", "/nonexistent/flowgrindd.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
