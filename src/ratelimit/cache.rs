//! Shared local-cache counter store backed by moka.
//!
//! The cache owns reclamation: each entry carries its own time-to-live, and the
//! TTL is only re-issued when an increase asks for a later expiry than the one
//! already recorded. Increases on the same key are serialised by the cache's
//! per-key compute lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use moka::Expiry;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{Counter, Transition};
use super::store::{self, CounterStore};
use crate::error::{Result, WardenError};

/// Default upper bound on live counters.
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

/// Cached counter plus the TTL to issue for this write, if any.
#[derive(Debug, Clone)]
struct CachedCounter {
    counter: Counter,
    /// `Some` when this write moved the expiry; the cache re-arms its timer.
    reissue_ttl: Option<Duration>,
}

/// Per-entry expiry that only re-arms when a write asks for it.
struct CounterExpiry;

impl Expiry<String, CachedCounter> for CounterExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedCounter,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.reissue_ttl
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &CachedCounter,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedCounter,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // Keep the running timer unless this write extended the window.
        value.reissue_ttl.or(duration_until_expiry)
    }
}

/// Counter store delegating storage and expiry to a concurrent TTL cache.
///
/// The cache is bounded by `max_capacity`. Once full it evicts entries before
/// they expire, and an evicted counter starts over at its next increase, so
/// size the capacity above the number of keys live within one window.
/// Evictions are logged and counted.
#[derive(Clone)]
pub struct SharedCacheStore {
    cache: Cache<String, CachedCounter>,
    clock: Arc<dyn Clock>,
    evictions: Arc<AtomicU64>,
}

impl std::fmt::Debug for SharedCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCacheStore")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl SharedCacheStore {
    /// Create a store holding at most `max_capacity` counters.
    pub fn new(max_capacity: u64) -> Self {
        Self::with_clock(max_capacity, Arc::new(SystemClock::new()))
    }

    /// Create a store with a specific clock for logical expiry.
    pub fn with_clock(max_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counted = evictions.clone();
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(CounterExpiry)
            .eviction_listener(move |key: Arc<String>, value: CachedCounter, cause| {
                if cause == RemovalCause::Size {
                    counted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %key,
                        count = value.counter.count,
                        max_capacity,
                        "Shared cache evicted a counter before expiry"
                    );
                }
            })
            .build();
        Self {
            cache,
            clock,
            evictions,
        }
    }

    /// Counters dropped because the cache was full.
    pub fn capacity_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Current value for a key, zero when absent or expired.
    pub fn count(&self, key: &str) -> u64 {
        let now = self.clock.now_millis();
        self.cache
            .get(key)
            .map(|cached| cached.counter.live_count(now))
            .unwrap_or(0)
    }

    fn apply(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64> {
        let now = self.clock.now_millis();
        let ttl_ms = ttl_secs.saturating_mul(1000);

        let result = self.cache.entry_by_ref(key).and_compute_with(|existing| {
            let mut counter = existing
                .map(|entry| entry.into_value().counter)
                .unwrap_or_default();

            // Read the recorded expiry first; only re-issue the TTL when later.
            let transition = counter.hit(now, ttl_ms, step);
            let reissue_ttl = match transition {
                Transition::Created | Transition::Extended => {
                    Some(Duration::from_millis(counter.expire_at_ms.saturating_sub(now)))
                }
                Transition::Kept => None,
            };
            Op::Put(CachedCounter {
                counter,
                reissue_ttl,
            })
        });

        let cached = match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => entry.into_value(),
            _ => {
                return Err(WardenError::StoreUnavailable(format!(
                    "shared cache did not store counter {key}"
                )))
            }
        };

        if cached.reissue_ttl.is_some() {
            debug!(key = %key, expire_at_ms = cached.counter.expire_at_ms, "Re-issued cache TTL");
        }
        trace!(key = %key, count = cached.counter.count, "Increased shared-cache counter");
        Ok(cached.counter.count)
    }
}

impl Default for SharedCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

#[async_trait]
impl CounterStore for SharedCacheStore {
    async fn increase(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64> {
        store::validate(key, ttl_secs, step)?;
        self.apply(key, ttl_secs, step)
    }

    fn name(&self) -> &'static str {
        "shared-cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_at(secs: u64) -> (SharedCacheStore, ManualClock) {
        let clock = ManualClock::at_secs(secs);
        (
            SharedCacheStore::with_clock(1_000, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_sequential_increases_count_up() {
        let (store, _clock) = store_at(1_000);

        for expected in 1..=4 {
            assert_eq!(store.increase("k", 60, 1).await.unwrap(), expected);
        }
        assert_eq!(store.count("k"), 4);
    }

    #[tokio::test]
    async fn test_counter_resets_after_ttl() {
        let (store, clock) = store_at(1_000);

        store.increase("k", 30, 1).await.unwrap();
        store.increase("k", 30, 1).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.increase("k", 30, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_short_ttl_does_not_shorten_window() {
        let (store, clock) = store_at(1_000);

        store.increase("k", 600, 1).await.unwrap();
        store.increase("k", 1, 1).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.increase("k", 1, 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_rejected() {
        let (store, _clock) = store_at(1_000);

        assert!(store.increase("", 60, 1).await.is_err());
        assert!(store.increase("k", 0, 1).await.is_err());
        assert_eq!(store.count("k"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increases_return_every_value_once() {
        let (store, _clock) = store_at(1_000);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::with_capacity(500);
                    for _ in 0..500 {
                        seen.push(store.increase("hot", 60, 1).await.unwrap());
                    }
                    seen
                })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.extend(handle.await.unwrap());
        }
        values.sort_unstable();

        assert_eq!(values, (1..=4_000).collect::<Vec<u64>>());
        assert_eq!(store.count("hot"), 4_000);
    }

    #[tokio::test]
    async fn test_capacity_evictions_are_counted() {
        let clock = ManualClock::at_secs(1_000);
        let store = SharedCacheStore::with_clock(4, Arc::new(clock));

        for i in 0..64 {
            store.increase(&format!("k{i}"), 60, 1).await.unwrap();
        }
        store.cache.run_pending_tasks();

        assert!(store.cache.entry_count() <= 4);
        assert!(store.capacity_evictions() > 0);
    }

    #[test]
    fn test_expiry_keeps_timer_unless_reissued() {
        let expiry = CounterExpiry;
        let key = "k".to_string();
        let remaining = Some(Duration::from_secs(50));

        let kept = CachedCounter {
            counter: Counter::default(),
            reissue_ttl: None,
        };
        assert_eq!(
            expiry.expire_after_update(&key, &kept, Instant::now(), remaining),
            remaining
        );

        let extended = CachedCounter {
            counter: Counter::default(),
            reissue_ttl: Some(Duration::from_secs(90)),
        };
        assert_eq!(
            expiry.expire_after_update(&key, &extended, Instant::now(), remaining),
            Some(Duration::from_secs(90))
        );
    }
}
