//! Server configuration loaded from environment variables.
//!
//! Every setting has a default; `.env` files are honoured through `dotenvy`
//! in `main` before this is read.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::SyncServerConfig;

/// Errors raised while reading configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Complete server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub storage: StorageConfig,
    pub sync: SyncServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            storage: StorageConfig::default(),
            sync: SyncServerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reader = Reader { lookup: &lookup };

        let mut storage = defaults.storage;
        if let Some(path) = lookup("STORAGE_PATH") {
            storage.path = path;
        }
        storage.cache_size = reader.parse("STORAGE_CACHE_BYTES", storage.cache_size)?;

        let sync = SyncServerConfig {
            max_channels: reader.positive("MAX_CHANNELS", defaults.sync.max_channels)?,
            max_peers_per_channel: reader
                .positive("MAX_PEERS_PER_CHANNEL", defaults.sync.max_peers_per_channel)?,
            max_document_chars: reader
                .positive("MAX_DOCUMENT_CHARS", defaults.sync.max_document_chars)?,
            history_min_retained: reader
                .parse("HISTORY_MIN_RETAINED", defaults.sync.history_min_retained)?,
            save_interval: reader.seconds("SAVE_INTERVAL_SECS", defaults.sync.save_interval)?,
            cleanup_interval: reader
                .seconds("CLEANUP_INTERVAL_SECS", defaults.sync.cleanup_interval)?,
            session_timeout: reader
                .seconds("SESSION_TIMEOUT_SECS", defaults.sync.session_timeout)?,
            idle_channel_ttl: reader
                .seconds("IDLE_CHANNEL_TTL_SECS", defaults.sync.idle_channel_ttl)?,
        };

        Ok(Self {
            bind_addr: reader.parse("BIND_ADDR", defaults.bind_addr)?,
            port: reader.parse("PORT", defaults.port)?,
            storage,
            sync,
        })
    }

    /// Socket address to listen on
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

struct Reader<'a, F> {
    lookup: &'a F,
}

impl<F> Reader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(value) => {
                let parsed = value.trim().parse::<T>();
                parsed.map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            }
            None => Ok(default),
        }
    }

    fn positive(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default.as_secs())?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "interval must be at least one second".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}
