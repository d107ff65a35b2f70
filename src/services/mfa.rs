//! MFA challenge manager
//!
//! Challenge tokens are single use: claiming is an atomic get-and-delete on the cache.
//! A wrong code may put the challenge back for a limited number of retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    auth::{token::TokenGenerator, totp},
    cache::{CacheError, KvCache},
    clock::Clock,
    config::SecurityConfig,
    error::AppError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub user_id: Uuid,
    pub tenant_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Failed code attempts so far
    pub attempts: u32,
}

pub struct MfaChallengeManager {
    cache: Arc<dyn KvCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_attempts: u32,
    issuer: String,
}

fn challenge_key(token: &str) -> String {
    format!("mfa:challenge:{}", TokenGenerator::hash(token))
}

impl MfaChallengeManager {
    pub fn new(
        cache: Arc<dyn KvCache>,
        clock: Arc<dyn Clock>,
        security: &SecurityConfig,
    ) -> Self {
        Self {
            cache,
            clock,
            ttl: Duration::from_secs(security.mfa_challenge_ttl_secs),
            max_attempts: security.mfa_max_attempts.max(1),
            issuer: security.totp_issuer.clone(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new challenge and return its token.
    pub async fn issue(
        &self,
        user_id: Uuid,
        tenant_id: &str,
        username: &str,
    ) -> Result<String, AppError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::Config(format!("mfa challenge ttl: {}", e)))?;

        let challenge = MfaChallenge {
            user_id,
            tenant_id: tenant_id.to_string(),
            username: username.to_string(),
            created_at: now,
            expires_at: now + ttl,
            attempts: 0,
        };

        let token = TokenGenerator::generate();
        self.store(&token, &challenge, self.ttl).await?;

        tracing::debug!(user_id = %user_id, tenant_id = %tenant_id, "MFA challenge issued");
        Ok(token)
    }

    /// Atomically consume a challenge. Unknown, used and expired tokens all yield `None`.
    pub async fn claim(&self, token: &str) -> Result<Option<MfaChallenge>, CacheError> {
        let key = challenge_key(token);
        let Some(payload) = self.cache.take(&key).await? else {
            return Ok(None);
        };

        let challenge: MfaChallenge =
            serde_json::from_str(&payload).map_err(|e| CacheError::Malformed {
                key,
                reason: e.to_string(),
            })?;

        if challenge.expires_at <= self.clock.now() {
            return Ok(None);
        }

        Ok(Some(challenge))
    }

    /// Put a claimed challenge back after a wrong code.
    ///
    /// Returns false when the retry budget or the lifetime is exhausted.
    pub async fn restore(&self, token: &str, mut challenge: MfaChallenge) -> Result<bool, AppError> {
        challenge.attempts += 1;
        if challenge.attempts >= self.max_attempts {
            return Ok(false);
        }

        let remaining = challenge.expires_at - self.clock.now();
        let Ok(remaining) = remaining.to_std() else {
            return Ok(false);
        };
        if remaining.is_zero() {
            return Ok(false);
        }

        self.store(token, &challenge, remaining).await?;
        Ok(true)
    }

    /// Check a TOTP code against a base32 secret at the injected clock time.
    pub fn verify_code(&self, secret_b32: &str, code: &str, account: &str) -> Result<bool, AppError> {
        totp::verify_code(secret_b32, code, self.clock.now(), &self.issuer, account)
    }

    async fn store(&self, token: &str, challenge: &MfaChallenge, ttl: Duration) -> Result<(), AppError> {
        let payload = serde_json::to_string(challenge)
            .map_err(|e| AppError::Internal(format!("serialize mfa challenge: {}", e)))?;
        self.cache.set(&challenge_key(token), &payload, ttl).await?;
        Ok(())
    }
}
