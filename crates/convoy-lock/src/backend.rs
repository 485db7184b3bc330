//! Lock backend trait and in-memory implementation

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use convoy_ports::Clock;
use convoy_types::OwnerToken;

/// Backend failures. An unreachable store fails closed everywhere: the
/// caller must assume it does not hold the lock.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value lease operations. All three calls are atomic with respect
/// to one another for a given resource.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Create the lease iff the resource is free (or its lease expired).
    /// Returns whether the caller now owns it.
    async fn try_acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Refresh the TTL iff `owner` still holds the lease. A non-owner
    /// call returns false and changes nothing.
    async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LockError>;

    /// Delete the lease iff `owner` holds it. Non-owner calls are no-ops.
    async fn release(&self, resource: &str, owner: OwnerToken) -> Result<bool, LockError>;
}

struct Lease {
    owner: OwnerToken,
    expires_at: DateTime<Utc>,
}

/// In-memory backend with real TTL expiry, driven by the injected clock.
pub struct InMemoryLockBackend {
    leases: DashMap<String, Lease>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryLockBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate the lock store going down for fault-injection tests.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + ChronoDuration::milliseconds(ttl.as_millis() as i64)
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        // The entry API holds the shard lock, making check-and-set atomic.
        let mut acquired = false;
        let entry = self.leases.entry(resource.to_string());
        entry
            .and_modify(|lease| {
                if lease.expires_at <= now {
                    lease.owner = owner;
                    lease.expires_at = expires_at;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Lease { owner, expires_at }
            });
        Ok(acquired)
    }

    async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.check_available()?;
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        match self.leases.get_mut(resource) {
            Some(mut lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, owner: OwnerToken) -> Result<bool, LockError> {
        self.check_available()?;
        Ok(self
            .leases
            .remove_if(resource, |_, lease| lease.owner == owner)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_ports::ManualClock;

    fn backend() -> (Arc<ManualClock>, InMemoryLockBackend) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = InMemoryLockBackend::new(clock.clone());
        (clock, backend)
    }

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn second_acquirer_is_refused() {
        let (_, backend) = backend();
        let first = OwnerToken::generate();
        let second = OwnerToken::generate();

        assert!(backend.try_acquire("instance:i-xyz", first, TTL).await.unwrap());
        assert!(!backend.try_acquire("instance:i-xyz", second, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (clock, backend) = backend();
        let first = OwnerToken::generate();
        let second = OwnerToken::generate();

        assert!(backend.try_acquire("instance:i-xyz", first, TTL).await.unwrap());
        clock.advance(Duration::from_secs(601));
        assert!(backend.try_acquire("instance:i-xyz", second, TTL).await.unwrap());
        // The old holder can no longer renew or release.
        assert!(!backend.renew("instance:i-xyz", first, TTL).await.unwrap());
        assert!(!backend.release("instance:i-xyz", first).await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_only_for_the_owner() {
        let (clock, backend) = backend();
        let owner = OwnerToken::generate();
        let stranger = OwnerToken::generate();

        assert!(backend.try_acquire("r", owner, TTL).await.unwrap());
        assert!(!backend.renew("r", stranger, TTL).await.unwrap());

        clock.advance(Duration::from_secs(400));
        assert!(backend.renew("r", owner, TTL).await.unwrap());
        clock.advance(Duration::from_secs(400));
        // 800s since acquire but only 400s since renew: still held.
        assert!(!backend.try_acquire("r", stranger, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_owner_verified() {
        let (_, backend) = backend();
        let owner = OwnerToken::generate();
        let stranger = OwnerToken::generate();

        backend.try_acquire("r", owner, TTL).await.unwrap();
        assert!(!backend.release("r", stranger).await.unwrap());
        assert!(backend.release("r", owner).await.unwrap());
        assert!(backend.try_acquire("r", stranger, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn outage_fails_closed() {
        let (_, backend) = backend();
        backend.set_unavailable(true);
        let err = backend
            .try_acquire("r", OwnerToken::generate(), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable(_)));
    }
}
