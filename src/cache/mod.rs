//! TTL 键值缓存抽象
//!
//! 失败计数、账户锁、MFA 挑战、会话声明和吊销墓碑都保存在这里。
//! `incr` 与 `take` 必须是原子操作，锁定计数和单次使用的挑战依赖它们。

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// 缓存错误
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed cache value at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns true when a live key was removed.
    async fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically increments an integer counter. A counter created by this call
    /// expires after `window`; later increments leave the expiry untouched.
    async fn incr(&self, key: &str, window: Duration) -> Result<i64, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CacheError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), CacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Atomic get-and-delete. At most one concurrent caller observes the value.
    async fn take(&self, key: &str) -> Result<Option<String>, CacheError>;
}
