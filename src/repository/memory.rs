//! 内存仓储实现
//! 用于测试与无数据库的本地运行；语义与 PostgreSQL 实现保持一致

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AuditRepository, Directory, LinkFn, SessionRepository};
use crate::{
    error::AppError,
    models::{
        audit::{AuditLogEntry, AuditLogFilters},
        directory::{Credential, Membership, MembershipStatus, Tenant, TenantStatus, User},
        session::{Session, SessionPair},
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn check_available(flag: &AtomicBool, store: &str) -> Result<(), AppError> {
    if flag.load(Ordering::SeqCst) {
        return Err(AppError::Internal(format!("{} unavailable", store)));
    }
    Ok(())
}

// ==================== Sessions ====================

#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
    unavailable: AtomicBool,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储故障
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn duplicate(token_hash: &str) -> AppError {
    AppError::Internal(format!(
        "duplicate session token hash {}",
        crate::auth::token::TokenGenerator::fingerprint(token_hash)
    ))
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<(), AppError> {
        check_available(&self.unavailable, "session store")?;
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.token_hash) {
            return Err(duplicate(&session.token_hash));
        }
        sessions.insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn create_pair(&self, pair: &SessionPair) -> Result<(), AppError> {
        check_available(&self.unavailable, "session store")?;
        let mut sessions = lock(&self.sessions);
        for session in [&pair.access, &pair.refresh] {
            if sessions.contains_key(&session.token_hash) {
                return Err(duplicate(&session.token_hash));
            }
        }
        if pair.access.token_hash == pair.refresh.token_hash {
            return Err(duplicate(&pair.access.token_hash));
        }
        sessions.insert(pair.access.token_hash.clone(), pair.access.clone());
        sessions.insert(pair.refresh.token_hash.clone(), pair.refresh.clone());
        Ok(())
    }

    async fn find_active_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        check_available(&self.unavailable, "session store")?;
        Ok(lock(&self.sessions)
            .get(token_hash)
            .filter(|s| !s.is_expired(now))
            .cloned())
    }

    async fn delete_by_token_hash(&self, token_hash: &str) -> Result<bool, AppError> {
        check_available(&self.unavailable, "session store")?;
        Ok(lock(&self.sessions).remove(token_hash).is_some())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, AppError> {
        check_available(&self.unavailable, "session store")?;
        let mut sessions: Vec<Session> = lock(&self.sessions)
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError> {
        check_available(&self.unavailable, "session store")?;
        let mut sessions = lock(&self.sessions);
        let hashes: Vec<String> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.token_hash.clone())
            .collect();
        for hash in &hashes {
            sessions.remove(hash);
        }
        Ok(hashes)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        check_available(&self.unavailable, "session store")?;
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - sessions.len()) as u64)
    }
}

// ==================== Audit Logs ====================

#[derive(Default)]
pub struct MemoryAuditRepository {
    entries: Mutex<Vec<AuditLogEntry>>,
    unavailable: AtomicBool,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 按插入顺序返回租户的全部条目
    pub fn entries(&self, tenant_id: &str) -> Vec<AuditLogEntry> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    /// 原样写入一条已链接的条目（导入或重建存储），重复序号被拒绝
    pub fn import(&self, entry: AuditLogEntry) -> Result<(), AppError> {
        check_available(&self.unavailable, "audit store")?;
        let mut entries = lock(&self.entries);
        if entries
            .iter()
            .any(|e| e.tenant_id == entry.tenant_id && e.sequence == entry.sequence)
        {
            return Err(AppError::Internal(format!(
                "audit sequence {} already exists for tenant {}",
                entry.sequence, entry.tenant_id
            )));
        }
        entries.push(entry);
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn append_linked(
        &self,
        tenant_id: &str,
        link: &LinkFn<'_>,
    ) -> Result<AuditLogEntry, AppError> {
        check_available(&self.unavailable, "audit store")?;
        // 读链尾与写入在同一把锁内完成
        let mut entries = lock(&self.entries);
        let tail = entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .max_by_key(|e| e.sequence);
        let entry = link(tail);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn by_sequence(
        &self,
        tenant_id: &str,
        sequence: i64,
    ) -> Result<Option<AuditLogEntry>, AppError> {
        check_available(&self.unavailable, "audit store")?;
        Ok(lock(&self.entries)
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.sequence == sequence)
            .cloned())
    }

    async fn range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        check_available(&self.unavailable, "audit store")?;
        let mut found: Vec<AuditLogEntry> = lock(&self.entries)
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.sequence);
        Ok(found)
    }

    async fn query(
        &self,
        tenant_id: &str,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        check_available(&self.unavailable, "audit store")?;
        let mut found: Vec<AuditLogEntry> = lock(&self.entries)
            .iter()
            .filter(|e| e.tenant_id == tenant_id && filters.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(found
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, tenant_id: &str, filters: &AuditLogFilters) -> Result<i64, AppError> {
        check_available(&self.unavailable, "audit store")?;
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| e.tenant_id == tenant_id && filters.matches(e))
            .count() as i64)
    }
}

// ==================== Directory ====================

#[derive(Default)]
pub struct MemoryDirectory {
    tenants: DashMap<String, Tenant>,
    users: DashMap<Uuid, User>,
    credentials: DashMap<Uuid, Credential>,
    memberships: DashMap<(Uuid, String), Membership>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn insert_user(&self, user: User, password_hash: Option<String>) {
        if let Some(password_hash) = password_hash {
            self.credentials.insert(
                user.id,
                Credential {
                    user_id: user.id,
                    password_hash,
                },
            );
        }
        self.users.insert(user.id, user);
    }

    pub fn insert_membership(&self, membership: Membership) {
        self.memberships.insert(
            (membership.user_id, membership.tenant_id.clone()),
            membership,
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 修改租户状态，返回租户是否存在
    pub fn set_tenant_status(&self, tenant_id: &str, status: TenantStatus) -> bool {
        match self.tenants.get_mut(tenant_id) {
            Some(mut tenant) => {
                tenant.status = status;
                true
            }
            None => false,
        }
    }

    /// 修改成员状态，返回是否存在该成员关系
    pub fn set_membership_status(
        &self,
        user_id: Uuid,
        tenant_id: &str,
        status: MembershipStatus,
    ) -> bool {
        match self.memberships.get_mut(&(user_id, tenant_id.to_string())) {
            Some(mut membership) => {
                membership.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, AppError> {
        check_available(&self.unavailable, "directory")?;
        Ok(self.tenants.get(tenant_id).map(|t| t.clone()))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        check_available(&self.unavailable, "directory")?;
        Ok(self
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.clone()))
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        check_available(&self.unavailable, "directory")?;
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn find_credential(&self, user_id: Uuid) -> Result<Option<Credential>, AppError> {
        check_available(&self.unavailable, "directory")?;
        Ok(self.credentials.get(&user_id).map(|c| c.clone()))
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Membership>, AppError> {
        check_available(&self.unavailable, "directory")?;
        Ok(self
            .memberships
            .get(&(user_id, tenant_id.to_string()))
            .map(|m| m.clone()))
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), AppError> {
        check_available(&self.unavailable, "directory")?;
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.last_login_at = Some(at);
            user.last_login_ip = ip.map(str::to_string);
        }
        Ok(())
    }
}
