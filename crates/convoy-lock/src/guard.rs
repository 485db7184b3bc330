//! Lock guard with background renewal

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use convoy_types::OwnerToken;

use crate::backend::{LockBackend, LockError};

/// Lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease TTL.
    #[serde(with = "convoy_types::duration_millis")]
    pub ttl: Duration,
    /// Renewal runs every `ttl / renew_divisor`.
    pub renew_divisor: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            renew_divisor: 3,
        }
    }
}

impl LockConfig {
    pub fn renew_interval(&self) -> Duration {
        self.ttl / self.renew_divisor.max(1)
    }
}

/// Acquires per-instance leases and wraps them in guards.
pub struct InstanceLock {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl InstanceLock {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    /// Try to take the lease once. `Ok(None)` means another holder has
    /// it; an unreachable store is an error, which callers treat as not
    /// holding the lock.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
    ) -> Result<Option<LockGuard>, LockError> {
        if !self
            .backend
            .try_acquire(resource, owner, self.config.ttl)
            .await?
        {
            return Ok(None);
        }
        debug!(resource, %owner, "lock acquired");
        Ok(Some(LockGuard::start(
            self.backend.clone(),
            resource.to_string(),
            owner,
            self.config.clone(),
        )))
    }
}

/// Scopes a held lease to a block of work.
///
/// While the guard lives, a background task renews the lease at
/// `ttl / renew_divisor`. If a renewal is refused or the store becomes
/// unreachable, the guard cancels [`LockGuard::lost`] and stops renewing;
/// the holder must abandon the protected work. Dropping the guard always
/// releases (best-effort when not released explicitly).
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    resource: String,
    owner: OwnerToken,
    lost: CancellationToken,
    renewer: tokio::task::JoinHandle<()>,
    released: bool,
}

impl LockGuard {
    fn start(
        backend: Arc<dyn LockBackend>,
        resource: String,
        owner: OwnerToken,
        config: LockConfig,
    ) -> Self {
        let lost = CancellationToken::new();
        let renewer = tokio::spawn(Self::renew_loop(
            backend.clone(),
            resource.clone(),
            owner,
            config,
            lost.clone(),
        ));
        Self {
            backend,
            resource,
            owner,
            lost,
            renewer,
            released: false,
        }
    }

    async fn renew_loop(
        backend: Arc<dyn LockBackend>,
        resource: String,
        owner: OwnerToken,
        config: LockConfig,
        lost: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(config.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = lost.cancelled() => break,
                _ = ticker.tick() => {
                    match backend.renew(&resource, owner, config.ttl).await {
                        Ok(true) => {
                            debug!(resource = %resource, "lease renewed");
                        }
                        Ok(false) => {
                            warn!(resource = %resource, "lease lost: renewal refused");
                            lost.cancel();
                            break;
                        }
                        Err(LockError::Unavailable(reason)) => {
                            // Unreachable store means the lease may expire
                            // under us; treat it as lost.
                            warn!(resource = %resource, %reason, "lease lost: store unreachable");
                            lost.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Cancelled when the lease can no longer be trusted. The holder
    /// passes this (or a child of it) into the work the lock protects.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// Stop renewing and release the lease.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lost.cancel();
        self.renewer.abort();
        self.backend.release(&self.resource, self.owner).await?;
        debug!(resource = %self.resource, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lost.cancel();
        self.renewer.abort();
        if !self.released {
            // Best-effort release on unwind or early return; the TTL
            // bounds the damage if this never runs.
            let backend = self.backend.clone();
            let resource = std::mem::take(&mut self.resource);
            let owner = self.owner;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = backend.release(&resource, owner).await;
                });
            }
        }
    }
}
