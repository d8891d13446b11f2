use crate::config::LockSettings;
use crate::error::{AppError, Result};
use crate::lock::backend::LockBackend;
use crate::observability::{get_metrics, LatencyTimer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lock resource key for a user's account.
pub fn account_resource(user_id: Uuid) -> String {
    format!("account:{}", user_id)
}

/// A granted lease. Writes made under it carry `fencing_token`.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource_key: String,
    pub owner: String,
    pub fencing_token: i64,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockHandle {
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// True once the lease may have been granted to someone else.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    pub fn covers(&self, resource_key: &str) -> bool {
        self.resource_key == resource_key
    }
}

#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    pub ttl: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::from(&LockSettings::default())
    }
}

impl From<&LockSettings> for LockManagerConfig {
    fn from(settings: &LockSettings) -> Self {
        Self {
            ttl: settings.ttl(),
            timeout: settings.timeout(),
            poll_interval: settings.poll_interval(),
        }
    }
}

/// Per-resource mutual exclusion across instances.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockManagerConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockManagerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Waits up to `timeout` for the lease. Fails with `LockTimeout` when the
    /// holder does not let go in time and with `CoordinationUnavailable` when
    /// the backend cannot be reached; neither ever yields a handle.
    pub async fn acquire(
        &self,
        resource_key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let owner = Uuid::new_v4().to_string();
        let timer = LatencyTimer::new();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(fencing_token) = self.backend.try_acquire(resource_key, &owner, ttl).await? {
                get_metrics().record_lock_acquired(timer.elapsed_ms());
                tracing::debug!(
                    resource = %resource_key,
                    fencing_token,
                    "Lock acquired"
                );
                return Ok(LockHandle {
                    resource_key: resource_key.to_string(),
                    owner,
                    fencing_token,
                    acquired_at: Instant::now(),
                    ttl,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                get_metrics().record_lock_timeout();
                tracing::warn!(resource = %resource_key, "Timed out waiting for lock");
                return Err(AppError::LockTimeout {
                    resource: resource_key.to_string(),
                    waited_ms: timer.elapsed_ms() as u64,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Acquires the per-user account lock with the configured ttl and timeout.
    pub async fn acquire_account(&self, user_id: Uuid) -> Result<LockHandle> {
        self.acquire(&account_resource(user_id), self.config.ttl, self.config.timeout)
            .await
    }

    /// Idempotent; a lease that already expired or was taken over is left alone.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let released = self.backend.release(&handle.resource_key, &handle.owner).await?;
        if !released {
            tracing::debug!(
                resource = %handle.resource_key,
                fencing_token = handle.fencing_token,
                "Lock was no longer held at release"
            );
        }
        Ok(())
    }

    /// Runs `operation` while holding the account lock and always releases it.
    ///
    /// A write rejected as stale re-seeds the fence counter from the token the
    /// store holds, so a lost counter heals on the caller's next retry.
    pub async fn with_account_lock<T, F, Fut>(&self, user_id: Uuid, operation: F) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire_account(user_id).await?;
        let result = operation(handle.clone()).await;

        if let Err(AppError::StaleFencingToken { token, current, .. }) = &result {
            if current > token {
                tracing::warn!(
                    resource = %handle.resource_key,
                    token,
                    current,
                    "Fence counter behind stored token; re-seeding"
                );
                if let Err(e) = self.backend.raise_fence(&handle.resource_key, *current).await {
                    tracing::warn!(resource = %handle.resource_key, error = %e, "Failed to raise fence");
                }
            }
        }

        if let Err(e) = self.release(&handle).await {
            // The lease still lapses after its ttl.
            tracing::warn!(resource = %handle.resource_key, error = %e, "Failed to release lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::backend::InMemoryLockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(backend: InMemoryLockBackend) -> LockManager {
        LockManager::new(
            Arc::new(backend),
            LockManagerConfig {
                ttl: Duration::from_secs(5),
                timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let manager = manager(InMemoryLockBackend::new());
        let _held = manager.acquire_account(Uuid::nil()).await.unwrap();

        let err = manager.acquire_account(Uuid::nil()).await.unwrap_err();
        match err {
            AppError::LockTimeout { resource, waited_ms } => {
                assert_eq!(resource, account_resource(Uuid::nil()));
                assert!(waited_ms >= 40);
            }
            other => panic!("expected lock timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = manager(InMemoryLockBackend::new());
        let handle = manager.acquire_account(Uuid::nil()).await.unwrap();

        manager.release(&handle).await.unwrap();
        manager.release(&handle).await.unwrap();
        assert!(manager.acquire_account(Uuid::nil()).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let manager = Arc::new(LockManager::new(
            Arc::new(InMemoryLockBackend::new()),
            LockManagerConfig {
                ttl: Duration::from_secs(5),
                timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(2),
            },
        ));
        let first = manager.acquire_account(Uuid::nil()).await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire_account(Uuid::nil()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release(&first).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert!(second.fencing_token > first.fencing_token);
    }

    #[tokio::test]
    async fn test_with_account_lock_serializes_critical_sections() {
        let manager = Arc::new(LockManager::new(
            Arc::new(InMemoryLockBackend::new()),
            LockManagerConfig {
                ttl: Duration::from_secs(5),
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(1),
            },
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                manager
                    .with_account_lock(Uuid::nil(), |_handle| async move {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_backend_outage_never_yields_handle() {
        let backend = InMemoryLockBackend::new();
        backend.simulate_outage(true);
        let manager = manager(backend);

        let err = manager.acquire_account(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, AppError::CoordinationUnavailable(_)));
    }
}
