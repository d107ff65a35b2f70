//! Directory repository (租户/用户/凭据/成员关系)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::Directory;
use crate::{
    error::AppError,
    models::directory::{Credential, Membership, Tenant, User},
};

pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, AppError> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT id, name, status FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(tenant)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, display_name, mfa_enabled, mfa_secret,
                   last_login_at, last_login_ip
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, display_name, mfa_enabled, mfa_secret,
                   last_login_at, last_login_ip
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    async fn find_credential(&self, user_id: Uuid) -> Result<Option<Credential>, AppError> {
        let credential = sqlx::query_as::<_, Credential>(
            "SELECT user_id, password_hash FROM user_credentials WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(credential)
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Membership>, AppError> {
        let membership = sqlx::query_as::<_, Membership>(
            r#"
            SELECT user_id, tenant_id, status, roles, permissions
            FROM tenant_memberships
            WHERE user_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(membership)
    }

    /// 更新最后登录信息
    async fn record_login(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_login_at = $1, last_login_ip = $2 WHERE id = $3")
            .bind(at)
            .bind(ip)
            .bind(user_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}
