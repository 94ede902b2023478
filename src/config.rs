//! Configuration for the chat server and client.
//!
//! The server supports both command-line arguments and a TOML configuration
//! file; CLI arguments take precedence over config file values.

use crate::protocol::MAX_PAYLOAD_SIZE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4242;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(author = "relay-chat authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-user text chat server", long_about = None)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Directory holding per-user conversation logs
    #[arg(short = 'd', long)]
    pub db_path: Option<PathBuf>,

    /// Maximum number of simultaneous connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the chat client
#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(author = "relay-chat authors")]
#[command(version = "0.1.0")]
#[command(about = "Console client for the chat server", long_about = None)]
pub struct ClientArgs {
    /// Server IP address or host name
    pub ip: String,

    /// Server port
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Display name to log in with (defaults to the OS account name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Total time allowed for the TCP connect, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl ClientArgs {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Unsent bytes allowed per connection before it is dropped
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
            max_frame_size: default_max_frame_size(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
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
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    MAX_PAYLOAD_SIZE
}

fn default_max_pending_bytes() -> usize {
    4 * 1024 * 1024 // 4 MB
}

fn default_db_path() -> PathBuf {
    PathBuf::from("db")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub max_frame_size: usize,
    pub max_pending_bytes: usize,
    pub db_path: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            ServerArgs {
                port: None,
                config: None,
                host: None,
                db_path: None,
                max_connections: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let args = ServerArgs::try_parse().map_err(ConfigError::Cli)?;
        Self::from_args(args)
    }

    /// Resolve parsed arguments, reading the TOML file they point to.
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(args, toml_config))
    }

    /// CLI arguments take precedence over TOML values.
    fn merge(args: ServerArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: args.host.unwrap_or(toml_config.server.host),
            port: args.port.unwrap_or(toml_config.server.port),
            max_connections: args
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            events_capacity: toml_config.server.events_capacity,
            max_frame_size: toml_config.server.max_frame_size,
            max_pending_bytes: toml_config.server.max_pending_bytes,
            db_path: args.db_path.unwrap_or(toml_config.storage.db_path),
            log_level: if args.log_level != "info" {
                args.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Cli(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Cli(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_frame_size, MAX_PAYLOAD_SIZE);
        assert_eq!(config.db_path, PathBuf::from("db"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            max_connections = 16

            [storage]
            db_path = "/var/lib/chat"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.max_pending_bytes, default_max_pending_bytes());
        assert_eq!(config.storage.db_path, PathBuf::from("/var/lib/chat"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9000\nhost = \"127.0.0.1\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = ServerArgs::try_parse_from(["server", "7000", "--config", &path]).unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(ServerArgs::try_parse_from(["server", "notaport"]).is_err());
        assert!(ServerArgs::try_parse_from(["server", "70000"]).is_err());
        assert!(ServerArgs::try_parse_from(["server", "0"]).is_err());
    }

    #[test]
    fn test_client_args() {
        let args = ClientArgs::try_parse_from(["client", "10.0.0.1"]).unwrap();
        assert_eq!(args.port(), DEFAULT_PORT);
        assert_eq!(args.connect_timeout(), Duration::from_millis(5000));

        let args =
            ClientArgs::try_parse_from(["client", "10.0.0.1", "5555", "--name", "bob"]).unwrap();
        assert_eq!(args.port(), 5555);
        assert_eq!(args.name.as_deref(), Some("bob"));

        assert!(ClientArgs::try_parse_from(["client"]).is_err());
    }
}
