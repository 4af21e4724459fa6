//! In-process stand-ins for external collaborators.
//!
//! [`EmulatedRemote`] behaves like a single key-value server for the remote
//! store protocol: hash records, lazy expiry on access, a server clock, and
//! switchable outages. It lets protocol and cross-backend tests run without a
//! live server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::clock::Clock;
use super::remote::RemoteBackend;
use crate::error::{Result, WardenError};

#[derive(Debug, Default)]
struct Record {
    fields: HashMap<String, u64>,
    /// Absolute expiry in epoch seconds; `None` means no expiry.
    expire_at: Option<u64>,
}

/// Emulated remote key-value server.
///
/// All operations on the server are serialised by one lock, like a
/// single-threaded server executing commands and scripts one at a time.
#[derive(Debug)]
pub struct EmulatedRemote {
    records: Mutex<HashMap<String, Record>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    fail_next_expiry: AtomicBool,
}

impl EmulatedRemote {
    /// Create an empty server running on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            fail_next_expiry: AtomicBool::new(false),
        }
    }

    /// Simulate the server going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next expiry call fail after its preceding increment succeeded.
    pub fn fail_expiry_once(&self) {
        self.fail_next_expiry.store(true, Ordering::SeqCst);
    }

    /// Read a hash field of a live record.
    pub fn field(&self, key: &str, field: &str) -> Option<u64> {
        let mut records = self.records.lock();
        self.live_record(&mut records, key)
            .and_then(|record| record.fields.get(field).copied())
    }

    /// Absolute expiry of a live record, in epoch seconds.
    pub fn expire_at(&self, key: &str) -> Option<u64> {
        let mut records = self.records.lock();
        self.live_record(&mut records, key)
            .and_then(|record| record.expire_at)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WardenError::StoreUnavailable(
                "emulated remote is offline".to_string(),
            ))
        }
    }

    /// Drop the record if it has expired, then return it if still present.
    fn live_record<'a>(
        &self,
        records: &'a mut HashMap<String, Record>,
        key: &str,
    ) -> Option<&'a mut Record> {
        let now = self.clock.now_secs();
        let expired = records
            .get(key)
            .and_then(|record| record.expire_at)
            .is_some_and(|expire_at| now >= expire_at);
        if expired {
            records.remove(key);
        }
        records.get_mut(key)
    }
}

#[async_trait]
impl RemoteBackend for EmulatedRemote {
    async fn increment_field(&self, key: &str, field: &str, step: u64) -> Result<u64> {
        self.ensure_available()?;
        let mut records = self.records.lock();
        if self.live_record(&mut records, key).is_none() {
            records.insert(key.to_string(), Record::default());
        }
        let record = records
            .get_mut(key)
            .ok_or_else(|| WardenError::StoreUnavailable(format!("record {key} vanished")))?;
        let value = record.fields.entry(field.to_string()).or_insert(0);
        *value = value.saturating_add(step);
        Ok(*value)
    }

    async fn extend_expiry(&self, key: &str, expire_at_secs: u64) -> Result<bool> {
        self.ensure_available()?;
        if self.fail_next_expiry.swap(false, Ordering::SeqCst) {
            return Err(WardenError::StoreUnavailable(
                "emulated script failure".to_string(),
            ));
        }

        let now = self.clock.now_secs();
        let mut records = self.records.lock();
        let Some(record) = self.live_record(&mut records, key) else {
            return Ok(false);
        };
        if record.expire_at.is_some_and(|current| expire_at_secs <= current) {
            return Ok(false);
        }
        if expire_at_secs > now {
            record.expire_at = Some(expire_at_secs);
        } else {
            // An expiry in the past removes the record, as the server would.
            records.remove(key);
        }
        Ok(true)
    }

    async fn server_time(&self) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.clock.now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_without_expiry_is_always_extended() {
        let server = EmulatedRemote::new(Arc::new(ManualClock::at_secs(100)));

        server.increment_field("k", "count", 1).await.unwrap();
        assert_eq!(server.expire_at("k"), None);
        assert!(server.extend_expiry("k", 101).await.unwrap());
        assert_eq!(server.expire_at("k"), Some(101));
    }

    #[tokio::test]
    async fn test_past_expiry_removes_record_without_ttl() {
        let server = EmulatedRemote::new(Arc::new(ManualClock::at_secs(100)));

        server.increment_field("k", "count", 3).await.unwrap();
        assert!(server.extend_expiry("k", 100).await.unwrap());
        assert_eq!(server.field("k", "count"), None);
        assert_eq!(server.increment_field("k", "count", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_past_expiry_does_not_shorten_live_record() {
        let server = EmulatedRemote::new(Arc::new(ManualClock::at_secs(100)));

        server.increment_field("k", "count", 1).await.unwrap();
        server.extend_expiry("k", 160).await.unwrap();
        assert!(!server.extend_expiry("k", 50).await.unwrap());
        assert_eq!(server.expire_at("k"), Some(160));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_extended() {
        let server = EmulatedRemote::new(Arc::new(ManualClock::at_secs(100)));
        assert!(!server.extend_expiry("missing", 200).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_is_dropped() {
        let clock = ManualClock::at_secs(100);
        let server = EmulatedRemote::new(Arc::new(clock.clone()));

        server.increment_field("k", "count", 4).await.unwrap();
        server.extend_expiry("k", 110).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(server.field("k", "count"), None);
        assert_eq!(server.increment_field("k", "count", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_server_rejects_everything() {
        let server = EmulatedRemote::new(Arc::new(ManualClock::at_secs(100)));
        server.set_available(false);

        assert!(server.server_time().await.is_err());
        assert!(server.increment_field("k", "count", 1).await.is_err());
        assert!(server.extend_expiry("k", 200).await.is_err());

        server.set_available(true);
        assert_eq!(server.server_time().await.unwrap(), 100);
    }
}
