//! Configuration management for the server.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables prefixed `SKV__`, nested with `__`
//!    (for example `SKV__SERVER__PORT=7000`)

use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;
use skv_engine::{ShardConfig, WalConfig};

use crate::error::ServerError;

/// Default accept backlog for the listening socket.
pub const DEFAULT_CONN_BACKLOG_SIZE: i32 = 128;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shards: ShardConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

impl Settings {
    /// Loads settings from defaults, an optional file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ServerError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SKV")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind; names are not resolved.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Size of each socket read.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Capacity of the transport-to-command byte channel.
    #[serde(default = "default_channel_capacity")]
    pub inbound_capacity: usize,
    /// Capacity of the command-to-transport payload channel.
    #[serde(default = "default_channel_capacity")]
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            read_buffer_size: default_read_buffer_size(),
            inbound_capacity: default_channel_capacity(),
            outbound_capacity: default_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7379
}

fn default_backlog() -> i32 {
    DEFAULT_CONN_BACKLOG_SIZE
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_channel_capacity() -> usize {
    64
}

/// Watch manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Capacity of the subscription request channel.
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            subscription_capacity: default_subscription_capacity(),
        }
    }
}

fn default_subscription_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            ansi: default_ansi(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}
