//! 登录失败锁定
//!
//! 失败计数在首次失败时开始计时，窗口内后续失败不会延长窗口。
//! 达到阈值后写入固定时长的锁标记；是否锁定只看锁标记。

use std::sync::Arc;
use std::time::Duration;

use crate::{
    cache::{CacheError, KvCache},
    config::SecurityConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub attempts: u32,
    pub locked: bool,
}

pub struct LockoutGuard {
    cache: Arc<dyn KvCache>,
    max_attempts: u32,
    window: Duration,
    lock_duration: Duration,
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

fn attempts_key(identifier: &str) -> String {
    format!("lockout:attempts:{}", normalize(identifier))
}

fn lock_key(identifier: &str) -> String {
    format!("lockout:lock:{}", normalize(identifier))
}

impl LockoutGuard {
    pub fn new(
        cache: Arc<dyn KvCache>,
        max_attempts: u32,
        window: Duration,
        lock_duration: Duration,
    ) -> Self {
        Self {
            cache,
            max_attempts,
            window,
            lock_duration,
        }
    }

    pub fn from_config(cache: Arc<dyn KvCache>, security: &SecurityConfig) -> Self {
        Self::new(
            cache,
            security.max_login_attempts,
            Duration::from_secs(security.failed_login_window_secs),
            Duration::from_secs(security.login_lockout_duration_secs),
        )
    }

    /// 记录一次失败登录
    pub async fn record_failed_login(&self, identifier: &str) -> Result<LockoutStatus, CacheError> {
        // 窗口只在计数创建时设置，后续失败不会延长
        let count = self.cache.incr(&attempts_key(identifier), self.window).await?;

        let attempts = u32::try_from(count).unwrap_or(u32::MAX);
        let locked = attempts >= self.max_attempts;

        if locked {
            self.cache
                .set(&lock_key(identifier), "1", self.lock_duration)
                .await?;
            metrics::counter!("lockouts_total").increment(1);
            tracing::warn!(
                identifier = %normalize(identifier),
                attempts,
                lock_secs = self.lock_duration.as_secs(),
                "Account locked after repeated login failures"
            );
        } else {
            tracing::debug!(identifier = %normalize(identifier), attempts, "Failed login recorded");
        }

        Ok(LockoutStatus { attempts, locked })
    }

    pub async fn is_locked(&self, identifier: &str) -> Result<bool, CacheError> {
        Ok(self.cache.get(&lock_key(identifier)).await?.is_some())
    }

    /// 清除失败计数；`unlock` 为 true 时同时解除锁定
    pub async fn clear(&self, identifier: &str, unlock: bool) -> Result<(), CacheError> {
        self.cache.del(&attempts_key(identifier)).await?;
        if unlock {
            self.cache.del(&lock_key(identifier)).await?;
        }
        Ok(())
    }

    /// 当前窗口内的失败次数
    pub async fn attempts(&self, identifier: &str) -> Result<u32, CacheError> {
        let value = self.cache.get(&attempts_key(identifier)).await?;
        match value {
            Some(v) => v.parse::<u32>().map_err(|_| CacheError::Malformed {
                key: attempts_key(identifier),
                reason: "counter is not an integer".to_string(),
            }),
            None => Ok(0),
        }
    }
}
