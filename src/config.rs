//! Configuration module for line-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::command::Responder;
use crate::net::DEFAULT_BACKLOG;
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(author = "line-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Line-oriented TCP echo server and console client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Maximum line length in bytes, excluding the line feed
    #[arg(long, global = true)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Accept connections and answer line commands
    Server {
        /// Port to listen on
        port: Option<u16>,

        /// Address to bind to
        #[arg(long)]
        host: Option<String>,

        /// Listen queue length
        #[arg(long)]
        backlog: Option<u32>,

        /// Maximum concurrent sessions (0 = unbounded)
        #[arg(short = 'm', long)]
        max_connections: Option<usize>,
    },
    /// Connect to a server and relay console input
    Client {
        /// Server host
        host: Option<String>,

        /// Server port
        port: Option<u16>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// 0 = unbounded
    #[serde(default)]
    pub max_connections: usize,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: 0,
            workers: None,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Session cap, if any.
    pub fn session_limit(&self) -> Option<usize> {
        (self.max_connections > 0).then_some(self.max_connections)
    }
}

/// Client-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
        }
    }
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Wire protocol limits and presentation text
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_welcome")]
    pub welcome: String,
    #[serde(default = "default_farewell")]
    pub farewell: String,
    #[serde(default = "default_echo_marker")]
    pub echo_marker: String,
    /// strftime pattern for `time` responses
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            welcome: default_welcome(),
            farewell: default_farewell(),
            echo_marker: default_echo_marker(),
            time_format: default_time_format(),
        }
    }
}

impl ProtocolConfig {
    /// Check that every configured response fits on one line and that the
    /// time format can be rendered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_length == 0 {
            return Err(ConfigError::InvalidLineLength);
        }

        for (name, text) in [
            ("welcome", &self.welcome),
            ("farewell", &self.farewell),
            ("echo_marker", &self.echo_marker),
            ("time_format", &self.time_format),
        ] {
            if text.contains('\n') {
                return Err(ConfigError::InvalidMarker(name));
            }
        }

        if StrftimeItems::new(&self.time_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidTimeFormat(self.time_format.clone()));
        }

        // Specifiers such as `%n` render a line feed without one in the pattern.
        if self.render_time().contains('\n') {
            return Err(ConfigError::InvalidTimeFormat(self.time_format.clone()));
        }

        Ok(())
    }

    /// Longest line a server with this configuration may send.
    ///
    /// An echo reply is the marker followed by a full-length request, so a
    /// reader sized at `max_line_length` alone would reject it.
    pub fn reply_line_limit(&self) -> usize {
        (self.max_line_length + self.echo_marker.len())
            .max(self.welcome.len())
            .max(self.farewell.len())
            .max(self.render_time().len())
    }

    /// Only call once the pattern is known to parse; rendering an invalid
    /// pattern panics.
    fn render_time(&self) -> String {
        Local::now().format(&self.time_format).to_string()
    }

    pub fn responder(&self) -> Responder {
        Responder::new(
            self.echo_marker.clone(),
            self.farewell.clone(),
            self.time_format.clone(),
        )
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

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_welcome() -> String {
    "Connected to server. Type a message.".to_string()
}

fn default_farewell() -> String {
    "Goodbye".to_string()
}

fn default_echo_marker() -> String {
    "[echo] ".to_string()
}

fn default_time_format() -> String {
    "%Y-%m-%dT%H:%M:%S%.3f".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which side of the protocol this process plays.
#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub protocol: ProtocolConfig,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the optional TOML file.
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

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut protocol = toml_config.protocol;
        if let Some(max_line_length) = cli.max_line_length {
            protocol.max_line_length = max_line_length;
        }
        protocol.validate()?;

        let role = match cli.role {
            RoleArgs::Server {
                port,
                host,
                backlog,
                max_connections,
            } => {
                let file = toml_config.server.clone();
                Role::Server(ServerConfig {
                    host: host.unwrap_or(file.host),
                    port: port.unwrap_or(file.port),
                    backlog: backlog.unwrap_or(file.backlog),
                    max_connections: max_connections.unwrap_or(file.max_connections),
                    workers: file.workers,
                })
            }
            RoleArgs::Client { host, port } => {
                let file = toml_config.client;
                Role::Client(ClientConfig {
                    host: host.unwrap_or(file.host),
                    port: port.unwrap_or(file.port),
                })
            }
        };

        Ok(Config {
            role,
            protocol,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("max_line_length must be greater than zero")]
    InvalidLineLength,

    #[error("protocol.{0} must not contain a line feed")]
    InvalidMarker(&'static str),

    #[error("invalid time format '{0}'")]
    InvalidTimeFormat(String),
}
