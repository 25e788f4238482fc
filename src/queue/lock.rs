//! Expiring named locks shared by every worker on the same database
//!
//! A lock is a row keyed by name holding a random token and an expiry.
//! Acquiring is set-if-absent; an expired row is treated as absent.

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapters::sqlite::locks;
use crate::adapters::sqlite::DbPool;
use crate::error::Result;

#[derive(Clone)]
pub struct DistributedLock {
    pool: DbPool,
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

impl DistributedLock {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Returns true if the lock was taken. A held lock is not an error.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let token = uuid::Uuid::new_v4().to_string();
        locks::try_acquire(&self.pool, key, &token, Utc::now().timestamp_millis(), ttl_ms(ttl))
    }

    /// Release whatever holds `key`.
    pub fn release(&self, key: &str) -> Result<bool> {
        locks::release(&self.pool, key)
    }

    pub fn is_locked(&self, key: &str) -> Result<bool> {
        locks::is_held(&self.pool, key, Utc::now().timestamp_millis())
    }

    /// Take the lock and return a guard that releases it on drop.
    pub fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        if !locks::try_acquire(&self.pool, key, &token, Utc::now().timestamp_millis(), ttl_ms(ttl))? {
            debug!(lock = %key, "Lock already held");
            return Ok(None);
        }
        Ok(Some(LockGuard {
            pool: self.pool.clone(),
            key: key.to_string(),
            token,
            released: false,
        }))
    }
}

/// Held lock. Only releases the row if this guard's token still owns it,
/// so a guard outliving its TTL cannot free someone else's lock.
pub struct LockGuard {
    pool: DbPool,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        locks::release_owned(&self.pool, &self.key, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = locks::release_owned(&self.pool, &self.key, &self.token) {
            warn!(lock = %self.key, "Failed to release lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool;

    fn lock() -> DistributedLock {
        DistributedLock::new(pool::in_memory().expect("pool"))
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let lock = lock();
        assert!(lock.acquire("history_c1__100", Duration::from_secs(300)).unwrap());
        assert!(!lock.acquire("history_c1__100", Duration::from_secs(300)).unwrap());
        assert!(lock.acquire("history_c1__101", Duration::from_secs(300)).unwrap());

        assert!(lock.release("history_c1__100").unwrap());
        assert!(lock.acquire("history_c1__100", Duration::from_secs(300)).unwrap());
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let lock = lock();
        assert!(lock.acquire("k", Duration::ZERO).unwrap());
        assert!(!lock.is_locked("k").unwrap());
        assert!(lock.acquire("k", Duration::from_secs(60)).unwrap());
        assert!(lock.is_locked("k").unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = lock();
        {
            let guard = lock.try_lock("k", Duration::from_secs(60)).unwrap().expect("taken");
            assert_eq!(guard.key(), "k");
            assert!(lock.try_lock("k", Duration::from_secs(60)).unwrap().is_none());
        }
        assert!(!lock.is_locked("k").unwrap());
    }

    #[test]
    fn test_stale_guard_does_not_free_new_holder() {
        let lock = lock();
        let stale = lock.try_lock("k", Duration::ZERO).unwrap().expect("taken");
        let fresh = lock.try_lock("k", Duration::from_secs(60)).unwrap().expect("retaken");
        assert!(!stale.release().unwrap());
        assert!(lock.is_locked("k").unwrap());
        drop(fresh);
        assert!(!lock.is_locked("k").unwrap());
    }
}
