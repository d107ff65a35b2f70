//! 令牌授权服务：密码 / 刷新 / MFA 授予、令牌轮换、吊销与内省
//!
//! 会话存储是权威来源；缓存写入尽力而为，吊销墓碑例外（写失败即整体失败）。
//! 所有外部调用都受 `security.store_timeout_ms` 约束。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    audit_service::AuditService, lockout::LockoutGuard, mfa::MfaChallengeManager,
    session_cache::SessionCache,
};
use crate::{
    auth::{password::PasswordHasher, token::TokenGenerator},
    cache::KvCache,
    clock::Clock,
    config::SecurityConfig,
    error::AppError,
    models::{
        audit::{AuditEvent, AuditEventType},
        auth::{
            ClientContext, GrantOutcome, GrantRequest, MfaGrant, MfaRequiredResponse,
            PasswordGrant, RefreshGrant, RevokeResponse, TokenResponse,
        },
        directory::{Membership, MembershipStatus, Tenant, User},
        session::{Session, SessionClaims, SessionKind, SessionPair},
    },
    repository::{Directory, SessionRepository},
};

/// Collaborators injected into the authority
pub struct AuthorityDeps {
    pub directory: Arc<dyn Directory>,
    pub sessions: Arc<dyn SessionRepository>,
    pub cache: Arc<dyn KvCache>,
    pub audit: Arc<AuditService>,
    pub clock: Arc<dyn Clock>,
}

pub struct TokenAuthority {
    directory: Arc<dyn Directory>,
    sessions: Arc<dyn SessionRepository>,
    session_cache: SessionCache,
    lockout: LockoutGuard,
    mfa: MfaChallengeManager,
    hasher: PasswordHasher,
    audit: Arc<AuditService>,
    clock: Arc<dyn Clock>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    store_timeout: Duration,
}

/// 新签发的令牌对及其会话记录（轮换失败时用于回滚）
struct IssuedPair {
    response: TokenResponse,
    pair: SessionPair,
}

fn check_tenant(tenant: Option<Tenant>) -> Result<Tenant, AppError> {
    match tenant {
        Some(tenant) if tenant.is_active() => Ok(tenant),
        _ => Err(AppError::TenantInactive),
    }
}

fn check_membership(membership: Option<Membership>) -> Result<Membership, AppError> {
    let membership = membership.ok_or(AppError::TenantInactive)?;
    match membership.status {
        MembershipStatus::Active => Ok(membership),
        MembershipStatus::PasswordExpired => Err(AppError::PasswordExpired),
        _ => Err(AppError::AccountLocked),
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, AppError> {
    chrono::Duration::from_std(d).map_err(|e| AppError::Config(format!("token lifetime: {}", e)))
}

impl TokenAuthority {
    pub fn new(deps: AuthorityDeps, security: &SecurityConfig) -> Result<Self, AppError> {
        let refresh_ttl = Duration::from_secs(security.refresh_token_exp_secs);

        Ok(Self {
            session_cache: SessionCache::new(deps.cache.clone(), refresh_ttl),
            lockout: LockoutGuard::from_config(deps.cache.clone(), security),
            mfa: MfaChallengeManager::new(deps.cache, deps.clock.clone(), security),
            hasher: PasswordHasher::from_config(security)?,
            directory: deps.directory,
            sessions: deps.sessions,
            audit: deps.audit,
            clock: deps.clock,
            access_ttl: Duration::from_secs(security.access_token_exp_secs),
            refresh_ttl,
            store_timeout: Duration::from_millis(security.store_timeout_ms),
        })
    }

    pub fn lockout(&self) -> &LockoutGuard {
        &self.lockout
    }

    // ==================== Grants ====================

    /// 处理 `/oauth/token` 授予请求
    pub async fn issue_tokens(
        &self,
        grant: GrantRequest,
        ctx: &ClientContext,
    ) -> Result<GrantOutcome, AppError> {
        let grant_type = grant.grant_type();

        let result = match grant {
            GrantRequest::Password(g) => self.password_grant(g, ctx).await,
            GrantRequest::RefreshToken(g) => self.refresh_grant(g, ctx).await.map(GrantOutcome::Tokens),
            GrantRequest::Mfa(g) => self.mfa_grant(g, ctx).await.map(GrantOutcome::Tokens),
        };

        let outcome = match &result {
            Ok(GrantOutcome::Tokens(_)) => "success",
            Ok(GrantOutcome::MfaRequired(_)) => "mfa_required",
            Err(e) => e.code(),
        };
        metrics::counter!("auth_grants_total", "grant" => grant_type, "outcome" => outcome)
            .increment(1);

        result
    }

    async fn password_grant(
        &self,
        g: PasswordGrant,
        ctx: &ClientContext,
    ) -> Result<GrantOutcome, AppError> {
        // 锁定判断不依赖目录；租户只用于审计归属，查询失败时跳过
        if self.is_locked(&g.username).await {
            let audit_tenant = self
                .best_effort("find_tenant", self.directory.find_tenant(&g.tenant_id))
                .await
                .flatten()
                .map(|t| t.id);
            self.audit_login_failure(
                audit_tenant.as_deref(),
                &g.username,
                None,
                "account_locked",
                ctx,
            )
            .await;
            return Err(AppError::AccountLocked);
        }

        let tenant = self
            .bounded("find_tenant", self.directory.find_tenant(&g.tenant_id))
            .await?;
        let audit_tenant = tenant.as_ref().map(|t| t.id.clone());
        let audit_tenant = audit_tenant.as_deref();

        // 检查租户状态
        let tenant = match check_tenant(tenant) {
            Ok(tenant) => tenant,
            Err(e) => {
                self.audit_login_failure(audit_tenant, &g.username, None, "tenant_inactive", ctx)
                    .await;
                return Err(e);
            }
        };

        // 获取用户
        let user = self
            .bounded("find_user", self.directory.find_user_by_username(&g.username))
            .await?;
        let Some(user) = user else {
            self.hasher.verify_dummy(&g.password);
            self.record_credential_failure(Some(&tenant.id), &g.username, None, "unknown_user", ctx)
                .await;
            return Err(AppError::InvalidCredentials);
        };

        // 验证密码
        let credential = self
            .bounded("find_credential", self.directory.find_credential(user.id))
            .await?;
        let password_ok = match &credential {
            Some(credential) => self.hasher.verify(&g.password, &credential.password_hash)?,
            None => {
                self.hasher.verify_dummy(&g.password);
                false
            }
        };
        if !password_ok {
            self.record_credential_failure(
                Some(&tenant.id),
                &g.username,
                Some(user.id),
                "bad_password",
                ctx,
            )
            .await;
            return Err(AppError::InvalidCredentials);
        }

        // 检查成员关系
        let membership = self
            .bounded(
                "find_membership",
                self.directory.find_membership(user.id, &tenant.id),
            )
            .await?;
        let membership = match check_membership(membership) {
            Ok(membership) => membership,
            Err(e) => {
                self.audit_login_failure(
                    Some(&tenant.id),
                    &g.username,
                    Some(user.id),
                    e.code(),
                    ctx,
                )
                .await;
                return Err(e);
            }
        };

        // 需要二次验证
        if user.mfa_enabled {
            let challenge_token = self
                .bounded("mfa_issue", self.mfa.issue(user.id, &tenant.id, &user.username))
                .await?;

            self.audit(
                Some(&tenant.id),
                AuditEvent::new(AuditEventType::MfaChallengeIssued, "login")
                    .user(Some(user.id), &user.username)
                    .client(ctx.ip.clone(), ctx.user_agent.clone()),
            )
            .await;

            return Ok(GrantOutcome::MfaRequired(MfaRequiredResponse {
                mfa_required: true,
                challenge_token,
                expires_in: self.mfa.ttl().as_secs(),
            }));
        }

        let tokens = self
            .complete_login(&user, &tenant.id, &membership, "password", ctx)
            .await?;
        Ok(GrantOutcome::Tokens(tokens))
    }

    async fn refresh_grant(
        &self,
        g: RefreshGrant,
        ctx: &ClientContext,
    ) -> Result<TokenResponse, AppError> {
        let token_hash = TokenGenerator::hash(&g.refresh_token);

        if self.is_revoked(&token_hash).await {
            tracing::debug!(
                token = TokenGenerator::fingerprint(&token_hash),
                "Refresh with revoked token"
            );
            return Err(AppError::InvalidToken);
        }

        let session = self
            .bounded(
                "find_session",
                self.sessions
                    .find_active_by_token_hash(&token_hash, self.clock.now()),
            )
            .await?
            .filter(|s| s.kind == SessionKind::Refresh)
            .ok_or(AppError::InvalidToken)?;
        let tenant_id = session.tenant_id.clone().ok_or(AppError::InvalidToken)?;

        // 重新校验用户、租户与成员关系
        let user = self
            .bounded("find_user", self.directory.find_user(session.user_id))
            .await?
            .ok_or(AppError::InvalidToken)?;
        let tenant = self
            .bounded("find_tenant", self.directory.find_tenant(&tenant_id))
            .await?;
        check_tenant(tenant)?;
        let membership = self
            .bounded(
                "find_membership",
                self.directory.find_membership(user.id, &tenant_id),
            )
            .await?;
        let membership = check_membership(membership)?;

        let issued = self.issue_pair(&user, &tenant_id, &membership, ctx).await?;

        // 消费旧刷新令牌；只有删除成功的调用方才能拿到新令牌
        match self
            .bounded(
                "delete_session",
                self.sessions.delete_by_token_hash(&token_hash),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    user_id = %user.id,
                    token = TokenGenerator::fingerprint(&token_hash),
                    "Refresh token already consumed by a concurrent rotation"
                );
                self.discard(&issued.pair).await;
                return Err(AppError::InvalidToken);
            }
            Err(e) => {
                self.discard(&issued.pair).await;
                return Err(e);
            }
        }

        self.best_effort("tombstone", self.session_cache.revoke_token(&token_hash))
            .await;

        self.audit(
            Some(&tenant_id),
            AuditEvent::new(AuditEventType::TokenRefreshed, "refresh")
                .user(Some(user.id), &user.username)
                .resource("session", issued.pair.refresh.id.to_string())
                .client(ctx.ip.clone(), ctx.user_agent.clone())
                .details(serde_json::json!({ "replaced_session": session.id })),
        )
        .await;

        tracing::info!(user_id = %user.id, tenant_id = %tenant_id, "Refresh token rotated");
        Ok(issued.response)
    }

    async fn mfa_grant(&self, g: MfaGrant, ctx: &ClientContext) -> Result<TokenResponse, AppError> {
        let challenge = self
            .bounded("mfa_claim", self.mfa.claim(&g.challenge_token))
            .await?
            .ok_or(AppError::InvalidMfaChallenge)?;

        let user = self
            .bounded("find_user", self.directory.find_user(challenge.user_id))
            .await?
            .ok_or(AppError::InvalidMfaChallenge)?;
        let secret = user
            .mfa_secret
            .as_deref()
            .ok_or_else(|| AppError::Internal("MFA enabled without a secret".to_string()))?;

        if !self.mfa.verify_code(secret, &g.code, &user.username)? {
            let locked = self
                .record_credential_failure(
                    Some(&challenge.tenant_id),
                    &user.username,
                    Some(user.id),
                    "bad_mfa_code",
                    ctx,
                )
                .await;

            if !locked {
                let restored = self
                    .bounded("mfa_restore", self.mfa.restore(&g.challenge_token, challenge))
                    .await;
                if let Err(e) = restored {
                    tracing::warn!(error = %e, "Failed to restore MFA challenge");
                }
            }
            return Err(AppError::InvalidMfaCode);
        }

        // 完成时重新检查锁定、租户与成员状态
        if self.is_locked(&user.username).await {
            self.audit_login_failure(
                Some(&challenge.tenant_id),
                &user.username,
                Some(user.id),
                "account_locked",
                ctx,
            )
            .await;
            return Err(AppError::AccountLocked);
        }
        let tenant = self
            .bounded("find_tenant", self.directory.find_tenant(&challenge.tenant_id))
            .await?;
        check_tenant(tenant)?;
        let membership = self
            .bounded(
                "find_membership",
                self.directory.find_membership(user.id, &challenge.tenant_id),
            )
            .await?;
        let membership = check_membership(membership)?;

        self.complete_login(&user, &challenge.tenant_id, &membership, "mfa", ctx)
            .await
    }

    /// 登录成功的收尾：签发令牌、清除失败计数、更新登录信息、写审计
    async fn complete_login(
        &self,
        user: &User,
        tenant_id: &str,
        membership: &Membership,
        method: &str,
        ctx: &ClientContext,
    ) -> Result<TokenResponse, AppError> {
        let issued = self.issue_pair(user, tenant_id, membership, ctx).await?;

        self.best_effort("lockout_clear", self.lockout.clear(&user.username, false))
            .await;
        self.best_effort(
            "record_login",
            self.directory
                .record_login(user.id, self.clock.now(), ctx.ip.as_deref()),
        )
        .await;

        self.audit(
            Some(tenant_id),
            AuditEvent::new(AuditEventType::LoginSuccess, "login")
                .user(Some(user.id), &user.username)
                .resource("session", issued.pair.access.id.to_string())
                .client(ctx.ip.clone(), ctx.user_agent.clone())
                .details(serde_json::json!({ "method": method })),
        )
        .await;

        tracing::info!(user_id = %user.id, tenant_id = %tenant_id, method, "Login succeeded");
        Ok(issued.response)
    }

    /// 生成令牌对并持久化两条会话（全有或全无），访问令牌声明写入缓存
    async fn issue_pair(
        &self,
        user: &User,
        tenant_id: &str,
        membership: &Membership,
        ctx: &ClientContext,
    ) -> Result<IssuedPair, AppError> {
        let now = self.clock.now();
        let access_token = TokenGenerator::generate();
        let refresh_token = TokenGenerator::generate();

        let session = |kind: SessionKind, token: &str, ttl: Duration| -> Result<Session, AppError> {
            Ok(Session {
                id: Uuid::new_v4(),
                user_id: user.id,
                tenant_id: Some(tenant_id.to_string()),
                kind,
                token_hash: TokenGenerator::hash(token),
                expires_at: now + to_chrono(ttl)?,
                ip_address: ctx.ip.clone(),
                user_agent: ctx.user_agent.clone(),
                created_at: now,
            })
        };

        let pair = SessionPair {
            access: session(SessionKind::Access, &access_token, self.access_ttl)?,
            refresh: session(SessionKind::Refresh, &refresh_token, self.refresh_ttl)?,
        };

        self.bounded("create_sessions", self.sessions.create_pair(&pair))
            .await?;

        let claims = SessionClaims {
            session_id: pair.access.id,
            user_id: user.id,
            tenant_id: Some(tenant_id.to_string()),
            username: user.username.clone(),
            roles: membership.roles.clone(),
            permissions: membership.permissions.clone(),
            expires_at: pair.access.expires_at,
        };
        self.best_effort(
            "cache_session",
            self.session_cache
                .cache_session(&pair.access.token_hash, &claims, self.access_ttl),
        )
        .await;

        Ok(IssuedPair {
            response: TokenResponse {
                access_token,
                token_type: "Bearer".to_string(),
                expires_in: self.access_ttl.as_secs(),
                refresh_token,
                refresh_expires_in: self.refresh_ttl.as_secs(),
            },
            pair,
        })
    }

    /// 丢弃未交付的令牌对
    async fn discard(&self, pair: &SessionPair) {
        for session in [&pair.access, &pair.refresh] {
            self.best_effort(
                "discard_session",
                self.sessions.delete_by_token_hash(&session.token_hash),
            )
            .await;
        }
        self.best_effort(
            "discard_cache",
            self.session_cache
                .invalidate(&pair.access.token_hash, pair.access.user_id),
        )
        .await;
    }

    // ==================== Revocation ====================

    /// 吊销单个令牌。未知令牌、或调用方不是会话所有者时同样返回成功但不做任何事。
    pub async fn revoke(
        &self,
        token: &str,
        hint: Option<SessionKind>,
        caller: Option<Uuid>,
        ctx: &ClientContext,
    ) -> Result<RevokeResponse, AppError> {
        let token_hash = TokenGenerator::hash(token);
        let session = self
            .bounded(
                "find_session",
                self.sessions
                    .find_active_by_token_hash(&token_hash, self.clock.now()),
            )
            .await?;

        let Some(session) = session else {
            tracing::debug!(
                token = TokenGenerator::fingerprint(&token_hash),
                "Revoke of unknown token"
            );
            return Ok(RevokeResponse { revoked: true });
        };

        if let Some(hint) = hint {
            if hint != session.kind {
                tracing::debug!(
                    hint = hint.as_str(),
                    kind = session.kind.as_str(),
                    "Token type hint mismatch"
                );
            }
        }

        if caller.is_some_and(|caller| caller != session.user_id) {
            tracing::warn!(
                session_id = %session.id,
                "Revoke requested by a caller who does not own the session"
            );
            return Ok(RevokeResponse { revoked: true });
        }

        // 墓碑先于删除写入
        self.bounded("tombstone", self.session_cache.revoke_token(&token_hash))
            .await?;
        self.bounded(
            "delete_session",
            self.sessions.delete_by_token_hash(&token_hash),
        )
        .await?;
        self.best_effort(
            "invalidate_cache",
            self.session_cache.invalidate(&token_hash, session.user_id),
        )
        .await;

        self.audit(
            session.tenant_id.as_deref(),
            AuditEvent::new(AuditEventType::TokenRevoked, "revoke")
                .resource("session", session.id.to_string())
                .client(ctx.ip.clone(), ctx.user_agent.clone())
                .details(serde_json::json!({ "kind": session.kind.as_str() })),
        )
        .await;

        tracing::info!(session_id = %session.id, user_id = %session.user_id, "Token revoked");
        Ok(RevokeResponse { revoked: true })
    }

    /// 登出所有设备：吊销用户的全部会话，返回数量
    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        tenant_id: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<u64, AppError> {
        let sessions = self
            .bounded("list_sessions", self.sessions.list_for_user(user_id))
            .await?;

        for session in &sessions {
            self.bounded(
                "tombstone",
                self.session_cache.revoke_token(&session.token_hash),
            )
            .await?;
        }

        let deleted = self
            .bounded("delete_sessions", self.sessions.delete_all_for_user(user_id))
            .await?;

        // 列表与删除之间新建的会话
        for hash in deleted
            .iter()
            .filter(|h| !sessions.iter().any(|s| &s.token_hash == *h))
        {
            self.best_effort("tombstone", self.session_cache.revoke_token(hash))
                .await;
        }

        self.best_effort(
            "invalidate_user_cache",
            self.session_cache.invalidate_user(user_id),
        )
        .await;

        let count = deleted.len() as u64;

        self.audit(
            tenant_id,
            AuditEvent::new(AuditEventType::SessionsRevoked, "logout_all")
                .user(Some(user_id), user_id.to_string())
                .client(ctx.ip.clone(), ctx.user_agent.clone())
                .details(serde_json::json!({ "sessions": count })),
        )
        .await;

        tracing::info!(user_id = %user_id, count, "All sessions revoked");
        Ok(count)
    }

    // ==================== Introspection ====================

    /// 解析访问令牌：墓碑 -> 缓存 -> 存储回源
    pub async fn introspect(&self, access_token: &str) -> Result<SessionClaims, AppError> {
        let token_hash = TokenGenerator::hash(access_token);
        let now = self.clock.now();

        if self.is_revoked(&token_hash).await {
            return Err(AppError::InvalidToken);
        }

        let cached = self
            .best_effort(
                "get_cached_session",
                self.session_cache.get_cached_session(&token_hash),
            )
            .await
            .flatten();
        if let Some(claims) = cached {
            if claims.expires_at > now {
                return Ok(claims);
            }
        }

        let session = self
            .bounded(
                "find_session",
                self.sessions.find_active_by_token_hash(&token_hash, now),
            )
            .await?
            .filter(|s| s.kind == SessionKind::Access)
            .ok_or(AppError::InvalidToken)?;
        let tenant_id = session.tenant_id.clone().ok_or(AppError::InvalidToken)?;

        let user = self
            .bounded("find_user", self.directory.find_user(session.user_id))
            .await?
            .ok_or(AppError::InvalidToken)?;
        let tenant = self
            .bounded("find_tenant", self.directory.find_tenant(&tenant_id))
            .await?;
        check_tenant(tenant).map_err(|_| AppError::InvalidToken)?;
        let membership = self
            .bounded(
                "find_membership",
                self.directory.find_membership(user.id, &tenant_id),
            )
            .await?;
        let membership = check_membership(membership).map_err(|_| AppError::InvalidToken)?;

        let claims = SessionClaims {
            session_id: session.id,
            user_id: user.id,
            tenant_id: Some(tenant_id),
            username: user.username,
            roles: membership.roles,
            permissions: membership.permissions,
            expires_at: session.expires_at,
        };

        if let Ok(remaining) = (session.expires_at - now).to_std() {
            self.best_effort(
                "cache_session",
                self.session_cache.cache_session(&token_hash, &claims, remaining),
            )
            .await;
        }

        Ok(claims)
    }

    /// 清理过期会话（后台定时任务调用）
    pub async fn purge_expired_sessions(&self) -> Result<u64, AppError> {
        self.bounded("purge_sessions", self.sessions.purge_expired(self.clock.now()))
            .await
    }

    // ==================== Helpers ====================

    async fn bounded<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                tracing::warn!(operation, "Store call timed out");
                Err(AppError::Timeout(operation.to_string()))
            }
        }
    }

    async fn best_effort<T, E, F>(&self, operation: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        match self.bounded(operation, fut).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(operation, error = %e, "Best-effort operation failed");
                None
            }
        }
    }

    /// 锁标记读取失败时按未锁定处理
    async fn is_locked(&self, username: &str) -> bool {
        self.best_effort("is_locked", self.lockout.is_locked(username))
            .await
            .unwrap_or(false)
    }

    /// 墓碑读取失败时按未吊销处理，由存储层兜底
    async fn is_revoked(&self, token_hash: &str) -> bool {
        self.best_effort("is_revoked", self.session_cache.is_revoked(token_hash))
            .await
            .unwrap_or(false)
    }

    /// 记录凭据校验失败，返回账户是否因此被锁定
    async fn record_credential_failure(
        &self,
        tenant_id: Option<&str>,
        username: &str,
        user_id: Option<Uuid>,
        reason: &str,
        ctx: &ClientContext,
    ) -> bool {
        self.audit_login_failure(tenant_id, username, user_id, reason, ctx)
            .await;

        let status = self
            .best_effort(
                "record_failed_login",
                self.lockout.record_failed_login(username),
            )
            .await;

        match status {
            Some(status) if status.locked => {
                self.audit(
                    tenant_id,
                    AuditEvent::new(AuditEventType::AccountLocked, "lockout")
                        .user(user_id, username)
                        .client(ctx.ip.clone(), ctx.user_agent.clone())
                        .details(serde_json::json!({ "attempts": status.attempts })),
                )
                .await;
                true
            }
            _ => false,
        }
    }

    async fn audit_login_failure(
        &self,
        tenant_id: Option<&str>,
        username: &str,
        user_id: Option<Uuid>,
        reason: &str,
        ctx: &ClientContext,
    ) {
        let event_type = if reason == "bad_mfa_code" {
            AuditEventType::MfaFailure
        } else {
            AuditEventType::LoginFailure
        };

        tracing::info!(username = %username, reason, "Login rejected");

        self.audit(
            tenant_id,
            AuditEvent::new(event_type, "login")
                .user(user_id, username)
                .client(ctx.ip.clone(), ctx.user_agent.clone())
                .details(serde_json::json!({ "reason": reason })),
        )
        .await;
    }

    /// 审计写入不影响授予结果
    async fn audit(&self, tenant_id: Option<&str>, event: AuditEvent) {
        if tokio::time::timeout(self.store_timeout, self.audit.record(tenant_id, event))
            .await
            .is_err()
        {
            tracing::warn!("Audit append timed out");
        }
    }
}
