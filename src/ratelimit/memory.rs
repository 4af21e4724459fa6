//! In-process counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::counter::{Counter, Transition};
use super::store::{self, CounterStore};
use crate::error::Result;

/// Counters held in process memory.
///
/// Keys are spread over the shards of a `DashMap`, so unrelated keys rarely
/// contend on the same lock. Expired counters are overwritten lazily on their
/// next access; [`MemoryStore::sweep`] (or the sweeper task) reclaims the rest.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store on a specific clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Remove every counter that has expired. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Swept expired counters");
        }
        removed
    }

    /// Start a background task sweeping expired counters every `every`.
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Current value for a key, zero when absent or expired.
    pub fn count(&self, key: &str) -> u64 {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .map(|counter| counter.live_count(now))
            .unwrap_or(0)
    }

    /// Number of stored counters, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters at all.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn apply(&self, key: &str, ttl_secs: u64, step: u64) -> u64 {
        let now = self.clock.now_millis();
        let ttl_ms = ttl_secs.saturating_mul(1000);

        let (count, transition, expire_at_ms) = match self.counters.get_mut(key) {
            Some(mut counter) => {
                let transition = counter.hit(now, ttl_ms, step);
                (counter.count, transition, counter.expire_at_ms)
            }
            None => {
                let mut counter = self.counters.entry(key.to_owned()).or_default();
                let transition = counter.hit(now, ttl_ms, step);
                (counter.count, transition, counter.expire_at_ms)
            }
        };

        if transition == Transition::Created {
            debug!(key = %key, ttl_secs, "Started counter window");
        }
        trace!(key = %key, count, expire_at_ms, ?transition, "Increased in-process counter");
        count
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increase(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64> {
        store::validate(key, ttl_secs, step)?;
        Ok(self.apply(key, ttl_secs, step))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
