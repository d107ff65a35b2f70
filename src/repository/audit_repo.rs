//! Audit repository (审计数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Row};

use super::{AuditRepository, LinkFn};
use crate::{
    error::AppError,
    models::audit::{AuditLogEntry, AuditLogFilters},
};

pub struct PgAuditRepository {
    db: PgPool,
}

impl PgAuditRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 追加 tenant_id 之后的过滤条件，返回下一个参数序号
fn push_filters(query: &mut String, filters: &AuditLogFilters) -> usize {
    let mut index = 1;

    if filters.event_type.is_some() {
        index += 1;
        query.push_str(&format!(" AND event_type = ${}", index));
    }
    if filters.category.is_some() {
        index += 1;
        query.push_str(&format!(" AND category = ${}", index));
    }
    if filters.user_id.is_some() {
        index += 1;
        query.push_str(&format!(" AND user_id = ${}", index));
    }
    if filters.start_time.is_some() {
        index += 1;
        query.push_str(&format!(" AND timestamp >= ${}", index));
    }
    if filters.end_time.is_some() {
        index += 1;
        query.push_str(&format!(" AND timestamp <= ${}", index));
    }

    index
}

macro_rules! bind_filters {
    ($builder:expr, $filters:expr) => {{
        let mut builder = $builder;
        if let Some(event_type) = &$filters.event_type {
            builder = builder.bind(event_type);
        }
        if let Some(category) = &$filters.category {
            builder = builder.bind(category);
        }
        if let Some(user_id) = $filters.user_id {
            builder = builder.bind(user_id);
        }
        if let Some(start_time) = $filters.start_time {
            builder = builder.bind(start_time);
        }
        if let Some(end_time) = $filters.end_time {
            builder = builder.bind(end_time);
        }
        builder
    }};
}

/// 插入审计日志；(tenant_id, sequence) 唯一约束拒绝分叉
async fn insert_entry<'e, E>(executor: E, entry: &AuditLogEntry) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_logs (
            id, tenant_id, sequence, event_type, category, user_id, user_name,
            resource_type, resource_id, action, ip, user_agent, details,
            timestamp, hash, previous_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.tenant_id)
    .bind(entry.sequence)
    .bind(&entry.event_type)
    .bind(&entry.category)
    .bind(entry.user_id)
    .bind(&entry.user_name)
    .bind(&entry.resource_type)
    .bind(&entry.resource_id)
    .bind(&entry.action)
    .bind(&entry.ip)
    .bind(&entry.user_agent)
    .bind(&entry.details)
    .bind(entry.timestamp)
    .bind(&entry.hash)
    .bind(&entry.previous_hash)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    /// 事务级咨询锁按租户串行化追加，多个实例共享同一把锁
    async fn append_linked(
        &self,
        tenant_id: &str,
        link: &LinkFn<'_>,
    ) -> Result<AuditLogEntry, AppError> {
        let mut tx = self.db.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        let tail = sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM audit_logs WHERE tenant_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let entry = link(tail.as_ref());
        insert_entry(&mut *tx, &entry).await?;

        tx.commit().await?;

        Ok(entry)
    }

    async fn by_sequence(
        &self,
        tenant_id: &str,
        sequence: i64,
    ) -> Result<Option<AuditLogEntry>, AppError> {
        let entry = sqlx::query_as::<_, AuditLogEntry>(
            "SELECT * FROM audit_logs WHERE tenant_id = $1 AND sequence = $2",
        )
        .bind(tenant_id)
        .bind(sequence)
        .fetch_optional(&self.db)
        .await?;

        Ok(entry)
    }

    async fn range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1 AND timestamp >= $2 AND timestamp <= $3
            ORDER BY sequence ASC
            "#,
        )
        .bind(tenant_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }

    /// 查询审计日志
    async fn query(
        &self,
        tenant_id: &str,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut query = String::from("SELECT * FROM audit_logs WHERE tenant_id = $1");
        let index = push_filters(&mut query, filters);
        query.push_str(&format!(
            " ORDER BY sequence DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let builder = sqlx::query_as::<_, AuditLogEntry>(&query).bind(tenant_id);
        let logs = bind_filters!(builder, filters)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(logs)
    }

    /// 统计审计日志数量
    async fn count(&self, tenant_id: &str, filters: &AuditLogFilters) -> Result<i64, AppError> {
        let mut query = String::from("SELECT COUNT(*) FROM audit_logs WHERE tenant_id = $1");
        push_filters(&mut query, filters);

        let builder = sqlx::query(&query).bind(tenant_id);
        let count: i64 = bind_filters!(builder, filters)
            .fetch_one(&self.db)
            .await?
            .get(0);

        Ok(count)
    }
}
