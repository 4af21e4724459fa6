//! Rate limiting engine: counter stores, limiter facade and rule evaluation.

#[cfg(feature = "shared-cache")]
mod cache;
mod clock;
mod counter;
mod guard;
mod limiter;
mod memory;
#[cfg(any(test, feature = "test-util"))]
pub mod mocks;
mod redis_backend;
mod remote;
mod rules;
mod store;
mod whitelist;

#[cfg(feature = "shared-cache")]
pub use cache::SharedCacheStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Counter, Transition};
pub use guard::{KeyResolver, RequestContext, RuleGuard};
pub use limiter::{ErrorFactory, Limiter, Violation, ViolationKind, DEFAULT_PREFIX};
pub use memory::MemoryStore;
pub use redis_backend::{RedisBackend, EXTEND_EXPIRY_SCRIPT};
pub use remote::{RemoteBackend, RemoteStore, TimeSource, COUNT_FIELD};
pub use rules::{KeyStrategy, RateLimitRule, RuleTable, DEFAULT_MESSAGE};
pub use store::CounterStore;
pub use whitelist::IpWhitelist;

/// Default upper bound on live counters in the shared cache store.
#[cfg(feature = "shared-cache")]
pub use cache::DEFAULT_MAX_CAPACITY;

/// Default upper bound on live counters in the shared cache store.
#[cfg(not(feature = "shared-cache"))]
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;
