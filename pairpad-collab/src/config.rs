//! Server configuration and environment loading.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_BIND: &str = "PAIRPAD_BIND";
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_CHANNEL_CAPACITY: &str = "PAIRPAD_CHANNEL_CAPACITY";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "PAIRPAD_IDLE_TIMEOUT_SECS";
pub const ENV_DATA_DIR: &str = "PAIRPAD_DATA_DIR";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "8000";

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it counts as failed
    pub channel_capacity: usize,
    /// Close connections that send nothing for this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// RocksDB directory (None = in-memory rooms only)
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            channel_capacity: 256,
            idle_timeout: None,
            data_dir: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

impl ServerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup. Unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bind) = lookup(ENV_BIND) {
            config.bind_addr = bind;
        } else if lookup(ENV_HOST).is_some() || lookup(ENV_PORT).is_some() {
            let host = lookup(ENV_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = lookup(ENV_PORT).unwrap_or_else(|| DEFAULT_PORT.to_string());
            config.bind_addr = format!("{host}:{port}");
        }

        if let Some(value) = lookup(ENV_CHANNEL_CAPACITY) {
            config.channel_capacity = parse_positive(ENV_CHANNEL_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT_SECS) {
            let secs: u64 = parse_positive(ENV_IDLE_TIMEOUT_SECS, &value)?;
            config.idle_timeout = Some(Duration::from_secs(secs));
        }
        config.data_dir = lookup(ENV_DATA_DIR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        }),
    }
}
