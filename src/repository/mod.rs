//! Database repository layer
//!
//! 服务层只依赖这里的 trait；生产环境使用 PostgreSQL 实现，测试与本地运行使用内存实现。

pub mod audit_repo;
pub mod directory_repo;
pub mod memory;
pub mod session_repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        audit::{AuditLogEntry, AuditLogFilters},
        directory::{Credential, Membership, Tenant, User},
        session::{Session, SessionPair},
    },
};

pub use audit_repo::PgAuditRepository;
pub use directory_repo::PgDirectory;
pub use memory::{MemoryAuditRepository, MemoryDirectory, MemorySessionRepository};
pub use session_repo::PgSessionRepository;

/// Durable session store. Authoritative over the session cache.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), AppError>;

    /// Persist both sessions or neither.
    async fn create_pair(&self, pair: &SessionPair) -> Result<(), AppError>;

    async fn find_active_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError>;

    /// Returns true only for the caller that actually removed the row.
    async fn delete_by_token_hash(&self, token_hash: &str) -> Result<bool, AppError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, AppError>;

    /// Removes every session of the user and returns their token hashes.
    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Builds the next entry from the current chain tail (None for an empty chain).
pub type LinkFn<'a> = dyn Fn(Option<&AuditLogEntry>) -> AuditLogEntry + Send + Sync + 'a;

/// Append-only audit entry store
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Reads the tenant's tail and inserts `link(tail)` as one atomic unit.
    /// Appenders in other processes are serialized by the store, not by the caller.
    async fn append_linked(
        &self,
        tenant_id: &str,
        link: &LinkFn<'_>,
    ) -> Result<AuditLogEntry, AppError>;

    async fn by_sequence(
        &self,
        tenant_id: &str,
        sequence: i64,
    ) -> Result<Option<AuditLogEntry>, AppError>;

    /// Entries with `start <= timestamp <= end`, ordered by sequence
    async fn range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, AppError>;

    /// Newest first
    async fn query(
        &self,
        tenant_id: &str,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditLogEntry>, AppError>;

    async fn count(&self, tenant_id: &str, filters: &AuditLogFilters) -> Result<i64, AppError>;
}

/// Tenants, users, credentials and memberships
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, AppError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AppError>;

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    async fn find_credential(&self, user_id: Uuid) -> Result<Option<Credential>, AppError>;

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Membership>, AppError>;

    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), AppError>;
}
