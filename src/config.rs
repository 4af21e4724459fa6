//! Configuration management for Ratewarden.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::ratelimit::{TimeSource, ViolationKind, DEFAULT_MAX_CAPACITY, DEFAULT_PREFIX};

/// Environment variable prefix, e.g. `RATEWARDEN__DRIVER=remote`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Counter store selection
    #[serde(default)]
    pub driver: Driver,

    /// IP patterns exempt from IP-keyed rules (CIDR or wildcard)
    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Prefix for every storage key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Violation kind used when a check does not name one
    #[serde(default)]
    pub violation_kind: ViolationKind,

    /// Remote store configuration
    #[serde(default)]
    pub remote: RemoteConfig,

    /// In-process store configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Shared cache store configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            driver: Driver::default(),
            ip_whitelist: Vec::new(),
            prefix: default_prefix(),
            violation_kind: ViolationKind::default(),
            remote: RemoteConfig::default(),
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Driver {
    /// Shared cache when compiled in, otherwise in-process memory
    #[default]
    Auto,
    /// In-process memory
    Memory,
    /// Host-local shared cache
    SharedCache,
    /// Remote key-value server
    Remote,
    /// Unrecognised name; treated as `Memory`
    Unknown(String),
}

impl From<String> for Driver {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Driver::Auto,
            "memory" => Driver::Memory,
            "shared-cache" | "shared_cache" | "cache" => Driver::SharedCache,
            "remote" | "redis" => Driver::Remote,
            _ => Driver::Unknown(value),
        }
    }
}

impl From<Driver> for String {
    fn from(driver: Driver) -> Self {
        driver.to_string()
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::Auto => write!(f, "auto"),
            Driver::Memory => write!(f, "memory"),
            Driver::SharedCache => write!(f, "shared-cache"),
            Driver::Remote => write!(f, "remote"),
            Driver::Unknown(name) => write!(f, "{}", name),
        }
    }
}

/// Remote store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Redis connection URL
    #[serde(default = "default_remote_url")]
    pub url: String,

    /// Upper bound for each round trip, in milliseconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_ms: u64,

    /// Clock used for expiry math
    #[serde(default)]
    pub time_source: TimeSource,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            timeout_ms: default_remote_timeout(),
            time_source: TimeSource::default(),
        }
    }
}

fn default_remote_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_remote_timeout() -> u64 {
    1000
}

/// In-process store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Sweep expired counters this often; no sweeping when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

/// Shared cache store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live counters. When more keys are live than this,
    /// counters are evicted early and restart from zero; keep it above the
    /// number of distinct keys hit within the longest window.
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl WardenConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered with
    /// `RATEWARDEN__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ip_whitelist")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
