//! 会话缓存
//!
//! 访问令牌声明的写穿缓存与吊销墓碑。存储层是权威来源，缓存只在 TTL 内可能过期。

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    cache::{CacheError, KvCache},
    models::session::SessionClaims,
};

pub struct SessionCache {
    cache: Arc<dyn KvCache>,
    tombstone_ttl: Duration,
}

fn session_key(token_hash: &str) -> String {
    format!("session:{}", token_hash)
}

fn revoked_key(token_hash: &str) -> String {
    format!("revoked:{}", token_hash)
}

fn user_index_key(user_id: Uuid) -> String {
    format!("user_sessions:{}", user_id)
}

impl SessionCache {
    /// `tombstone_ttl` 应不短于最长的令牌有效期
    pub fn new(cache: Arc<dyn KvCache>, tombstone_ttl: Duration) -> Self {
        Self {
            cache,
            tombstone_ttl,
        }
    }

    pub async fn cache_session(
        &self,
        token_hash: &str,
        claims: &SessionClaims,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(claims).map_err(|e| CacheError::Malformed {
            key: session_key(token_hash),
            reason: e.to_string(),
        })?;

        self.cache.set(&session_key(token_hash), &payload, ttl).await?;

        let index = user_index_key(claims.user_id);
        self.cache.sadd(&index, token_hash).await?;
        self.cache.expire(&index, self.tombstone_ttl).await?;
        Ok(())
    }

    pub async fn get_cached_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionClaims>, CacheError> {
        let key = session_key(token_hash);
        let Some(payload) = self.cache.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<SessionClaims>(&payload) {
            Ok(claims) => Ok(Some(claims)),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unreadable cached session");
                self.cache.del(&key).await?;
                Ok(None)
            }
        }
    }

    pub async fn invalidate(&self, token_hash: &str, user_id: Uuid) -> Result<(), CacheError> {
        self.cache.del(&session_key(token_hash)).await?;
        self.cache.srem(&user_index_key(user_id), token_hash).await?;
        Ok(())
    }

    /// 写入吊销墓碑
    pub async fn revoke_token(&self, token_hash: &str) -> Result<(), CacheError> {
        self.cache
            .set(&revoked_key(token_hash), "1", self.tombstone_ttl)
            .await
    }

    pub async fn is_revoked(&self, token_hash: &str) -> Result<bool, CacheError> {
        Ok(self.cache.get(&revoked_key(token_hash)).await?.is_some())
    }

    /// 清除用户的全部缓存声明，返回清除数量
    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<usize, CacheError> {
        let index = user_index_key(user_id);
        let hashes = self.cache.smembers(&index).await?;

        let mut removed = 0;
        for hash in &hashes {
            if self.cache.del(&session_key(hash)).await? {
                removed += 1;
            }
        }
        self.cache.del(&index).await?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn claims(user_id: Uuid) -> SessionClaims {
        SessionClaims {
            session_id: Uuid::new_v4(),
            user_id,
            tenant_id: Some("t1".into()),
            username: "alice".into(),
            roles: vec!["admin".into()],
            permissions: vec!["audit:verify".into()],
            expires_at: Utc::now(),
        }
    }

    fn session_cache() -> (Arc<ManualClock>, SessionCache) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        (clock, SessionCache::new(cache, Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn test_cache_and_expire() {
        let (clock, cache) = session_cache();
        let c = claims(Uuid::new_v4());
        cache.cache_session("h1", &c, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get_cached_session("h1").await.unwrap(), Some(c));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get_cached_session("h1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tombstone() {
        let (_clock, cache) = session_cache();
        assert!(!cache.is_revoked("h1").await.unwrap());
        cache.revoke_token("h1").await.unwrap();
        assert!(cache.is_revoked("h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_user() {
        let (_clock, cache) = session_cache();
        let user = Uuid::new_v4();
        cache.cache_session("h1", &claims(user), Duration::from_secs(60)).await.unwrap();
        cache.cache_session("h2", &claims(user), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.invalidate_user(user).await.unwrap(), 2);
        assert_eq!(cache.get_cached_session("h1").await.unwrap(), None);
        assert_eq!(cache.get_cached_session("h2").await.unwrap(), None);
    }
}
