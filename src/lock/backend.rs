use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Store that grants leases on named resources.
///
/// Every successful grant returns a fencing token strictly greater than any
/// token previously issued for the same resource.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// One non-blocking attempt. `Ok(None)` means someone else holds the lease.
    async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Option<i64>>;

    /// Deletes the lease only if `owner` still holds it.
    async fn release(&self, resource: &str, owner: &str) -> Result<bool>;

    /// Moves the fence counter up to at least `floor`, so the next grant
    /// outranks a token already persisted by the store. Never lowers it.
    async fn raise_fence(&self, resource: &str, floor: i64) -> Result<()>;
}

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct LockTable {
    leases: HashMap<String, Lease>,
    fences: HashMap<String, i64>,
}

/// Process-local backend. Only correct when every caller shares one
/// process; used by tests and single-node development.
#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    table: Arc<Mutex<LockTable>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the coordination store were down.
    pub fn simulate_outage(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::CoordinationUnavailable(
                "lock store unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Option<i64>> {
        self.check_available()?;
        let mut table = self.table.lock().await;
        let now = Instant::now();

        if let Some(lease) = table.leases.get(resource) {
            if lease.expires_at > now {
                return Ok(None);
            }
        }

        table.leases.insert(
            resource.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        let fence = table.fences.entry(resource.to_string()).or_insert(0);
        *fence += 1;

        Ok(Some(*fence))
    }

    async fn release(&self, resource: &str, owner: &str) -> Result<bool> {
        self.check_available()?;
        let mut table = self.table.lock().await;

        let owned = matches!(table.leases.get(resource), Some(lease) if lease.owner == owner);
        if owned {
            table.leases.remove(resource);
        }
        Ok(owned)
    }

    async fn raise_fence(&self, resource: &str, floor: i64) -> Result<()> {
        self.check_available()?;
        let mut table = self.table.lock().await;
        let fence = table.fences.entry(resource.to_string()).or_insert(0);
        *fence = (*fence).max(floor);
        Ok(())
    }
}
