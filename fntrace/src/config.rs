use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const SOCKET_ENV: &str = "FNTRACE_SOCKET";
pub const QUEUE_CAPACITY_ENV: &str = "FNTRACE_QUEUE_CAPACITY";
pub const RECONNECT_DELAY_ENV: &str = "FNTRACE_RECONNECT_DELAY_MS";
pub const POLL_INTERVAL_ENV: &str = "FNTRACE_POLL_INTERVAL_US";

/// Where the collector listens unless told otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/fntrace.sock";

/// Settings of the event relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Rendezvous point of the collector.
    pub socket_path: PathBuf,
    /// Records the relay can hold before producers start dropping.
    pub capacity: usize,
    /// Pause between connection attempts while disconnected.
    pub reconnect_delay: Duration,
    /// How long the worker sleeps when there is nothing to forward.
    pub poll_interval: Duration,
    /// Maximum records per send.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            capacity: 1 << 16,
            reconnect_delay: Duration::from_millis(5000),
            poll_interval: Duration::from_micros(1000),
            batch_size: 1024,
        }
    }
}

impl RelayConfig {
    /// Defaults, overridden by the `FNTRACE_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = RelayConfig::default();

        if let Some(path) = lookup(SOCKET_ENV) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(capacity) = parse(&lookup, QUEUE_CAPACITY_ENV)? {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity);
            }
            config.capacity = capacity;
        }
        if let Some(ms) = parse(&lookup, RECONNECT_DELAY_ENV)? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(us) = parse(&lookup, POLL_INTERVAL_ENV)? {
            config.poll_interval = Duration::from_micros(us);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
