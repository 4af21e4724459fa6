//! Limiter facade: store selection, key prefixing, whitelist and limit decisions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::memory::MemoryStore;
use super::redis_backend::RedisBackend;
use super::remote::RemoteStore;
use super::store::CounterStore;
use super::whitelist::IpWhitelist;
use crate::config::{Driver, WardenConfig};
use crate::error::{Result, WardenError, TOO_MANY_REQUESTS};

/// Default prefix for every storage key.
pub const DEFAULT_PREFIX: &str = "limiter";

/// Category of a rate limit violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Plain "too many requests".
    #[default]
    TooManyRequests,
    /// A longer-lived quota ran out.
    QuotaExhausted,
    /// Application-defined category, usually interpreted by an error factory.
    Custom(String),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::TooManyRequests => write!(f, "too_many_requests"),
            ViolationKind::QuotaExhausted => write!(f, "quota_exhausted"),
            ViolationKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Details of a failed check, handed to an [`ErrorFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Logical key that went over its limit
    pub key: String,
    /// Violation category
    pub kind: ViolationKind,
    /// Caller-configured message
    pub message: String,
    /// Always [`TOO_MANY_REQUESTS`]
    pub code: u16,
}

/// Builds the caller's own error type for a violation.
pub type ErrorFactory =
    Arc<dyn Fn(&Violation) -> Box<dyn std::error::Error + Send + Sync> + Send + Sync>;

/// The rate limiter facade.
///
/// Each instance owns its store, whitelist and prefix; independent instances
/// never share state unless they share a store.
pub struct Limiter {
    store: Arc<dyn CounterStore>,
    whitelist: IpWhitelist,
    prefix: String,
    default_kind: ViolationKind,
    error_factory: Option<ErrorFactory>,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("store", &self.store.name())
            .field("whitelist", &self.whitelist)
            .field("prefix", &self.prefix)
            .field("default_kind", &self.default_kind)
            .field("error_factory", &self.error_factory.is_some())
            .finish()
    }
}

impl Limiter {
    /// Create a limiter over `store` with the default prefix and no whitelist.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            whitelist: IpWhitelist::default(),
            prefix: DEFAULT_PREFIX.to_string(),
            default_kind: ViolationKind::default(),
            error_factory: None,
        }
    }

    /// Build a limiter from configuration, selecting and connecting its store.
    pub async fn from_config(config: &WardenConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Like [`Limiter::from_config`], with the clock the stores use.
    pub async fn from_config_with_clock(
        config: &WardenConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = build_store(config, clock).await?;
        info!(
            store = store.name(),
            prefix = %config.prefix,
            whitelist_entries = config.ip_whitelist.len(),
            "Rate limiter initialized"
        );

        Ok(Self::new(store)
            .with_prefix(config.prefix.clone())
            .with_whitelist(IpWhitelist::new(&config.ip_whitelist))
            .with_violation_kind(config.violation_kind.clone()))
    }

    /// Use a different storage key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use a different IP whitelist.
    pub fn with_whitelist(mut self, whitelist: IpWhitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    /// Use a different default violation kind.
    pub fn with_violation_kind(mut self, kind: ViolationKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Build violations with the caller's own error type.
    pub fn with_error_factory(mut self, factory: ErrorFactory) -> Self {
        self.error_factory = Some(factory);
        self
    }

    /// Name of the selected store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// The storage key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The violation kind used when a check does not name one.
    pub fn default_violation_kind(&self) -> &ViolationKind {
        &self.default_kind
    }

    /// Storage key for a logical key.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}-{}", self.prefix, key)
    }

    /// Count one hit against `key` and report whether it is within `limit`
    /// hits per `ttl_secs` window.
    ///
    /// Store failures are returned, never turned into a pass or a fail.
    pub async fn attempt(&self, key: &str, limit: u64, ttl_secs: u64) -> Result<bool> {
        let storage_key = self.storage_key(key);
        let count = self.store.increase(&storage_key, ttl_secs, 1).await?;
        let allowed = count <= limit;

        trace!(key = %storage_key, count, limit, allowed, "Rate limit attempt");
        Ok(allowed)
    }

    /// Like [`Limiter::attempt`], failing with a violation when over the limit.
    ///
    /// `kind` falls back to the configured default. Without an error factory
    /// the failure is [`WardenError::RateLimitExceeded`] with code 429.
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        ttl_secs: u64,
        message: &str,
        kind: Option<&ViolationKind>,
    ) -> Result<()> {
        if self.attempt(key, limit, ttl_secs).await? {
            return Ok(());
        }

        let violation = Violation {
            key: key.to_string(),
            kind: kind.unwrap_or(&self.default_kind).clone(),
            message: message.to_string(),
            code: TOO_MANY_REQUESTS,
        };
        debug!(key = %key, limit, ttl_secs, kind = %violation.kind, "Rate limit exceeded");
        Err(self.violation_error(violation))
    }

    /// Whether `ip` matches any whitelist entry.
    pub fn is_ip_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    fn violation_error(&self, violation: Violation) -> WardenError {
        match &self.error_factory {
            Some(factory) => WardenError::Rejected(factory(&violation)),
            None => WardenError::RateLimitExceeded {
                kind: violation.kind,
                message: violation.message,
                code: violation.code,
            },
        }
    }
}

async fn build_store(config: &WardenConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    let driver = match &config.driver {
        Driver::Auto => auto_driver(),
        Driver::Unknown(name) => {
            warn!(driver = %name, "Unknown rate limit driver, falling back to memory");
            Driver::Memory
        }
        other => other.clone(),
    };

    match driver {
        Driver::Remote => {
            let timeout = Duration::from_millis(config.remote.timeout_ms);
            let backend = RedisBackend::connect(&config.remote.url, timeout).await?;
            let store = RemoteStore::new(backend, clock)
                .with_time_source(config.remote.time_source);
            Ok(Arc::new(store))
        }
        Driver::SharedCache => shared_cache_store(config, clock),
        _ => Ok(memory_store(config, clock)),
    }
}

fn auto_driver() -> Driver {
    if cfg!(feature = "shared-cache") {
        Driver::SharedCache
    } else {
        Driver::Memory
    }
}

fn memory_store(config: &WardenConfig, clock: Arc<dyn Clock>) -> Arc<dyn CounterStore> {
    let store = Arc::new(MemoryStore::with_clock(clock));
    if let Some(secs) = config.memory.sweep_interval_secs.filter(|secs| *secs > 0) {
        store.spawn_sweeper(Duration::from_secs(secs));
    }
    store
}

#[cfg(feature = "shared-cache")]
fn shared_cache_store(
    config: &WardenConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CounterStore>> {
    use super::cache::SharedCacheStore;
    Ok(Arc::new(SharedCacheStore::with_clock(
        config.cache.max_capacity,
        clock,
    )))
}

#[cfg(not(feature = "shared-cache"))]
fn shared_cache_store(
    config: &WardenConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CounterStore>> {
    warn!("Shared cache store not compiled in, falling back to memory");
    Ok(memory_store(config, clock))
}
