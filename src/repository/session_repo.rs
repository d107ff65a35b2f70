//! Session repository (会话数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::SessionRepository;
use crate::{
    error::AppError,
    models::session::{Session, SessionPair},
};

pub struct PgSessionRepository {
    db: PgPool,
}

impl PgSessionRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

async fn insert_session<'e, E>(executor: E, session: &Session) -> Result<(), AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, user_id, tenant_id, kind, token_hash, expires_at, ip_address, user_agent, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(&session.tenant_id)
    .bind(session.kind.as_str())
    .bind(&session.token_hash)
    .bind(session.expires_at)
    .bind(&session.ip_address)
    .bind(&session.user_agent)
    .bind(session.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create(&self, session: &Session) -> Result<(), AppError> {
        insert_session(&self.db, session).await
    }

    /// 同一事务内写入访问/刷新会话
    async fn create_pair(&self, pair: &SessionPair) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        insert_session(&mut *tx, &pair.access).await?;
        insert_session(&mut *tx, &pair.refresh).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_active_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(session)
    }

    /// 删除即消费：rows_affected 决定并发轮换中的唯一胜者
    async fn delete_by_token_hash(&self, token_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>, AppError> {
        let hashes: Vec<String> =
            sqlx::query_scalar("DELETE FROM sessions WHERE user_id = $1 RETURNING token_hash")
                .bind(user_id)
                .fetch_all(&self.db)
                .await?;

        Ok(hashes)
    }

    /// 清理过期会话
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
