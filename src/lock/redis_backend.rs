use crate::error::{AppError, Result};
use crate::lock::backend::LockBackend;
use async_trait::async_trait;
use std::time::Duration;

/// `SET NX PX` on the lease key, then `INCR` on the fence key, atomically.
/// Returns the new fencing token, or 0 when the lease is held.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return redis.call('INCR', KEYS[2])
end
return 0
"#;

/// `max(fence, floor)`. The fence key has no expiry and is the only source of
/// token monotonicity; after it is lost, the first write rejected against the
/// stored token re-seeds it through this script.
const RAISE_FENCE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
    redis.call('SET', KEYS[1], ARGV[1])
end
return 1
"#;

/// Compare-and-delete: only the current owner may release.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed leases shared by every instance.
///
/// Any Redis error maps to `CoordinationUnavailable`, which callers treat as
/// "do not mutate".
pub struct RedisLockBackend {
    client: redis::Client,
    key_prefix: String,
    acquire: redis::Script,
    release: redis::Script,
    raise_fence: redis::Script,
}

impl RedisLockBackend {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
            raise_fence: redis::Script::new(RAISE_FENCE_SCRIPT),
        }
    }

    fn lease_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, resource)
    }

    fn fence_key(&self, resource: &str) -> String {
        format!("{}:fence:{}", self.key_prefix, resource)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }
}

fn unavailable(e: redis::RedisError) -> AppError {
    AppError::CoordinationUnavailable(e.to_string())
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<Option<i64>> {
        let mut conn = self.get_connection().await?;
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let token: i64 = self
            .acquire
            .key(self.lease_key(resource))
            .key(self.fence_key(resource))
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok((token > 0).then_some(token))
    }

    async fn release(&self, resource: &str, owner: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;

        let deleted: i64 = self
            .release
            .key(self.lease_key(resource))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(deleted > 0)
    }

    async fn raise_fence(&self, resource: &str, floor: i64) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let _: i64 = self
            .raise_fence
            .key(self.fence_key(resource))
            .arg(floor)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(())
    }
}
