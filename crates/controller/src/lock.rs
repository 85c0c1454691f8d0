//! Controller lock.
//!
//! A single entry in the lock table serializes control cycles across
//! processes. Acquiring is a conditional insert carrying an expiry; releasing
//! deletes the entry. Losing the race is the normal contention outcome, not
//! an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ess_cloud::{LockBackend, LockRecord, PutCondition, PutOutcome};
use tracing::{debug, info};

use crate::error::Result;

/// Identifier of the controller lock entry.
pub const LOCK_ID: &str = "replica-controller-lock";

/// Acquires and releases the controller lock.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    table: String,
    ttl: Duration,
    reclaim_expired: bool,
}

impl LockManager {
    /// Create a lock manager over `table`.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, table: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            table: table.into(),
            ttl,
            reclaim_expired: false,
        }
    }

    /// Allow taking over an entry whose expiry has passed.
    #[must_use]
    pub fn with_expired_reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim_expired = reclaim;
        self
    }

    /// Try to take the lock.
    ///
    /// Returns `false` when another holder owns it.
    ///
    /// # Errors
    /// Returns an error for any backend failure other than the condition
    /// check.
    pub async fn acquire(&self, lock_id: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let record = LockRecord {
            lock_id: lock_id.to_string(),
            expires_at: now.saturating_add(ttl),
        };
        let condition = if self.reclaim_expired {
            PutCondition::NotExistsOrExpired { now }
        } else {
            PutCondition::NotExists
        };

        match self.backend.put_lock(&self.table, &record, condition).await? {
            PutOutcome::Written => {
                info!(lock_id, expires_at = record.expires_at, "Lock acquired");
                Ok(true)
            }
            PutOutcome::ConditionFailed => {
                debug!(lock_id, "Lock already held");
                Ok(false)
            }
        }
    }

    /// Release the lock unconditionally.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn release(&self, lock_id: &str) -> Result<()> {
        self.backend.delete_lock(&self.table, lock_id).await?;
        info!(lock_id, "Lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_cloud::MemoryCloud;

    fn manager(cloud: &Arc<MemoryCloud>) -> LockManager {
        LockManager::new(cloud.clone(), "locks", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let cloud = Arc::new(MemoryCloud::new());
        let first = manager(&cloud);
        let second = manager(&cloud);

        assert!(first.acquire(LOCK_ID).await.unwrap());
        assert!(!second.acquire(LOCK_ID).await.unwrap());

        first.release(LOCK_ID).await.unwrap();
        assert!(second.acquire(LOCK_ID).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_entry_carries_expiry() {
        let cloud = Arc::new(MemoryCloud::new());
        let before = Utc::now().timestamp();
        assert!(manager(&cloud).acquire(LOCK_ID).await.unwrap());

        let expires_at = cloud.lock_expiry("locks", LOCK_ID).unwrap();
        assert!(expires_at >= before + 60);
        assert!(expires_at <= Utc::now().timestamp() + 60);
    }

    #[tokio::test]
    async fn test_expired_entry_reclaimed_only_when_enabled() {
        let cloud = Arc::new(MemoryCloud::new());
        let stale = LockRecord {
            lock_id: LOCK_ID.to_string(),
            expires_at: Utc::now().timestamp() - 5,
        };
        cloud
            .put_lock("locks", &stale, PutCondition::NotExists)
            .await
            .unwrap();

        assert!(!manager(&cloud).acquire(LOCK_ID).await.unwrap());
        assert!(manager(&cloud)
            .with_expired_reclaim(true)
            .acquire(LOCK_ID)
            .await
            .unwrap());
    }
}
