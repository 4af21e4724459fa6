//! Remote counter store protocol.
//!
//! Each counter is a hash record whose `count` field is incremented with the
//! backend's atomic field increment. Expiry is managed by a separate atomic
//! server-side routine that moves the record's expiry to a desired absolute
//! time only when that time is later than the current one. The two steps touch
//! different parts of the record, so neither can clobber the other, and a lost
//! race on the expiry step is a no-op rather than a shortened window.
//!
//! Callers take no locks; the backend provides all the atomicity.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::store::{self, CounterStore};
use crate::error::Result;

/// Hash field holding a counter's value.
pub const COUNT_FIELD: &str = "count";

/// Wire operations the remote protocol needs from a key-value server.
#[async_trait]
pub trait RemoteBackend: Send + Sync + Debug {
    /// Atomically add `step` to `field` of the hash at `key`, creating it if
    /// needed, and return the new value.
    async fn increment_field(&self, key: &str, field: &str, step: u64) -> Result<u64>;

    /// Atomically set the expiry of `key` to `expire_at_secs` (epoch seconds)
    /// only if that is strictly later than its current expiry. A key without
    /// an expiry counts as expiring infinitely early.
    ///
    /// Returns `true` when the expiry was updated.
    async fn extend_expiry(&self, key: &str, expire_at_secs: u64) -> Result<bool>;

    /// The server's own clock, in epoch seconds.
    async fn server_time(&self) -> Result<u64>;
}

/// Where the remote store takes "now" from when computing expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    /// Ask the server, so every caller shares one clock.
    #[default]
    Server,
    /// Use the store's local clock.
    Local,
}

/// Counter store that shares counters between processes through a remote server.
#[derive(Debug)]
pub struct RemoteStore<B: RemoteBackend> {
    backend: B,
    time_source: TimeSource,
    clock: Arc<dyn Clock>,
}

impl<B: RemoteBackend> RemoteStore<B> {
    /// Create a store that takes time from the server.
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            time_source: TimeSource::Server,
            clock,
        }
    }

    /// Choose where expiry math takes the current time from.
    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn now_secs(&self) -> Result<u64> {
        match self.time_source {
            TimeSource::Server => self.backend.server_time().await,
            TimeSource::Local => Ok(self.clock.now_secs()),
        }
    }

    async fn apply(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64> {
        let now = self.now_secs().await?;
        let desired_expire_at = now.saturating_add(ttl_secs);

        let count = self.backend.increment_field(key, COUNT_FIELD, step).await?;
        let extended = self.backend.extend_expiry(key, desired_expire_at).await?;

        if extended {
            debug!(key = %key, expire_at = desired_expire_at, "Extended remote counter expiry");
        }
        trace!(key = %key, count, "Increased remote counter");
        Ok(count)
    }
}

#[async_trait]
impl<B: RemoteBackend> CounterStore for RemoteStore<B> {
    async fn increase(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64> {
        store::validate(key, ttl_secs, step)?;
        self.apply(key, ttl_secs, step).await.map_err(|e| {
            warn!(key = %key, error = %e, "Remote counter store failed");
            e
        })
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
