//! Redis backend for the remote counter store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use super::remote::RemoteBackend;
use crate::error::{Result, WardenError};

/// Moves a key's expiry to `ARGV[1]` (epoch seconds) only if that is later
/// than the current expiry. A key without a TTL is treated as expiring at
/// minus infinity, so it always gets one; a desired time already in the past
/// removes the key. A missing key is left alone. Returns 1 when it updated the
/// expiry, 0 otherwise.
pub const EXTEND_EXPIRY_SCRIPT: &str = r#"
local key = KEYS[1]
local desired_ms = tonumber(ARGV[1]) * 1000

local pttl = redis.call('PTTL', key)
if pttl == -2 then
    return 0
end

if pttl ~= -1 then
    local time = redis.call('TIME')
    local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
    if desired_ms <= now_ms + pttl then
        return 0
    end
end

redis.call('PEXPIREAT', key, desired_ms)
return 1
"#;

/// Remote backend talking to a Redis server.
///
/// The connection manager reconnects on its own and is cheap to clone, so each
/// call works on its own clone. Every round trip is bounded by `timeout`.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    extend_script: Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    /// Returns [`WardenError::StoreUnavailable`] if the server cannot be reached.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!("Creating Redis client");

        let client = Client::open(url)?;
        let connection = bounded(timeout, ConnectionManager::new(client)).await?;

        info!("Redis client connected");

        Ok(Self {
            connection,
            extend_script: Script::new(EXTEND_EXPIRY_SCRIPT),
            timeout,
        })
    }

    /// Remaining TTL of `key` in seconds (-1 without expiry, -2 when missing).
    pub async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        bounded(self.timeout, conn.ttl(key)).await
    }

    /// Delete `key`. Only used to clean up after tests and tooling.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        bounded(self.timeout, conn.del::<_, ()>(key)).await
    }

    /// Round-trip check against the server.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = bounded(self.timeout, redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for RedisBackend {
    async fn increment_field(&self, key: &str, field: &str, step: u64) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: i64 = bounded(self.timeout, conn.hincr(key, field, step)).await?;
        u64::try_from(value).map_err(|_| {
            WardenError::StoreUnavailable(format!("counter {key} holds negative value {value}"))
        })
    }

    async fn extend_expiry(&self, key: &str, expire_at_secs: u64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let updated: i64 = bounded(
            self.timeout,
            self.extend_script
                .key(key)
                .arg(expire_at_secs)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(updated == 1)
    }

    async fn server_time(&self) -> Result<u64> {
        let mut conn = self.connection.clone();
        let (secs, _micros): (u64, u64) =
            bounded(self.timeout, redis::cmd("TIME").query_async(&mut conn)).await?;
        Ok(secs)
    }
}

/// Run one Redis round trip, turning errors and timeouts into store failures.
async fn bounded<T, F>(timeout: Duration, op: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result.map_err(WardenError::from),
        Err(_) => Err(WardenError::StoreUnavailable(format!(
            "redis call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
