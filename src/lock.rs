//! Short-lived mutual exclusion keyed by string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::InfraError;
use crate::store::Database;

/// A lease-style lock that expires on its own if the holder disappears.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `false` when another token holds a live lease on `key`.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, InfraError>;

    /// Release only if `token` still holds the lease.
    async fn release(&self, key: &str, token: &str) -> Result<(), InfraError>;
}

/// Random holder token.
pub fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// `DistributedLock` over the store's lease table.
pub struct StoreLock {
    store: Arc<dyn Database>,
}

impl StoreLock {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DistributedLock for StoreLock {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, InfraError> {
        self.store
            .try_acquire_lease(key, token, ttl)
            .await
            .map_err(|e| InfraError::LockUnavailable(e.to_string()))
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), InfraError> {
        self.store
            .release_lease(key, token)
            .await
            .map(|_| ())
            .map_err(|e| InfraError::LockUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn lock() -> StoreLock {
        StoreLock::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn second_holder_is_rejected_until_release() {
        let lock = lock().await;
        let ttl = Duration::from_secs(10);
        assert!(lock.acquire("k", "a", ttl).await.unwrap());
        assert!(!lock.acquire("k", "b", ttl).await.unwrap());

        // Wrong token leaves the lease in place.
        lock.release("k", "b").await.unwrap();
        assert!(!lock.acquire("k", "b", ttl).await.unwrap());

        lock.release("k", "a").await.unwrap();
        assert!(lock.acquire("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let lock = lock().await;
        assert!(lock.acquire("k", "a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock.acquire("k", "b", Duration::from_secs(10)).await.unwrap());
        // The old holder can no longer release it.
        lock.release("k", "a").await.unwrap();
        assert!(!lock.acquire("k", "c", Duration::from_secs(10)).await.unwrap());
    }

    #[test]
    fn tokens_are_distinct() {
        assert_ne!(new_token(), new_token());
        assert_eq!(new_token().len(), 24);
    }
}
