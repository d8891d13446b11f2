pub mod backend;
pub mod manager;
pub mod redis_backend;

pub use backend::{InMemoryLockBackend, LockBackend};
pub use manager::{account_resource, LockHandle, LockManager, LockManagerConfig};
pub use redis_backend::RedisLockBackend;
