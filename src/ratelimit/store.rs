//! Counter store contract shared by every backend.

use async_trait::async_trait;

use crate::error::{Result, WardenError};

/// A backend that keeps expiring, fixed-window counters.
///
/// Implemented by the in-process, shared-cache and remote stores so the
/// limiter facade can work with any of them.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `step` to the counter at `key` and return its value afterwards.
    ///
    /// A missing or expired counter is recreated with value `step` and expiry
    /// `now + ttl_secs`. A live counter keeps its expiry unless `now + ttl_secs`
    /// is later, in which case the expiry moves forward. Expiry never moves back.
    ///
    /// Fails with [`WardenError::StoreUnavailable`] when the backend cannot
    /// complete the operation.
    async fn increase(&self, key: &str, ttl_secs: u64, step: u64) -> Result<u64>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Reject arguments outside the contract before touching a backend.
pub(crate) fn validate(key: &str, ttl_secs: u64, step: u64) -> Result<()> {
    if key.is_empty() {
        return Err(WardenError::InvalidArgument("counter key must not be empty".into()));
    }
    if ttl_secs == 0 {
        return Err(WardenError::InvalidArgument(format!(
            "ttl must be at least one second for key {key}"
        )));
    }
    if step == 0 {
        return Err(WardenError::InvalidArgument(format!(
            "step must be at least one for key {key}"
        )));
    }
    Ok(())
}
