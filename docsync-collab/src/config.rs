//! Server configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults, a TOML file,
//! `DOCSYNC_*` environment variables. Command-line flags are applied on top by
//! the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "DOCSYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it is dropped as too slow
    pub outbound_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// Quiet period after the last edit before a save
    pub debounce_ms: u64,
    /// How long an unused document stays loaded
    pub eviction_grace_ms: u64,
    /// Timeout of a single store load or save
    pub persistence_timeout_ms: u64,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret shared with the token service
    pub jwt_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_ms: 30_000,
            debounce_ms: 2_000,
            eviction_grace_ms: 30_000,
            persistence_timeout_ms: 10_000,
            storage_path: None,
            jwt_secret: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `DOCSYNC_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a full variable name
    /// (e.g. `DOCSYNC_BIND_ADDR`) to its value.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("OUTBOUND_CAPACITY") {
            self.outbound_capacity = parse("OUTBOUND_CAPACITY", v)?;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse("HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = get("DEBOUNCE_MS") {
            self.debounce_ms = parse("DEBOUNCE_MS", v)?;
        }
        if let Some(v) = get("EVICTION_GRACE_MS") {
            self.eviction_grace_ms = parse("EVICTION_GRACE_MS", v)?;
        }
        if let Some(v) = get("PERSISTENCE_TIMEOUT_MS") {
            self.persistence_timeout_ms = parse("PERSISTENCE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = get("STORAGE_PATH") {
            self.storage_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = get("JWT_SECRET") {
            self.jwt_secret = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Empty("jwt_secret"));
        }
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Empty("bind_addr"));
        }
        let positive = [
            ("outbound_capacity", self.outbound_capacity as u64),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("debounce_ms", self.debounce_ms),
            ("eviction_grace_ms", self.eviction_grace_ms),
            ("persistence_timeout_ms", self.persistence_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value,
    })
}
