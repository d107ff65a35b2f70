//! PostgreSQL 连接池、迁移与就绪探测
//!
//! 迁移完成后确认 audit_logs 的只追加触发器仍然存在，缺失时拒绝启动。

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use std::str::FromStr;
use std::time::{Duration, Instant};

const APPLICATION_NAME: &str = "tenant-guard";

/// 迁移中创建的触发器，拒绝对 audit_logs 的 UPDATE / DELETE
const APPEND_ONLY_TRIGGER: &str = "audit_logs_append_only";

/// 创建数据库连接池
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let options = PgConnectOptions::from_str(config.url.expose_secret())
        .map_err(|e| DbError::ConnectionFailed(format!("invalid database url: {}", e)))?
        .application_name(APPLICATION_NAME);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create database pool");
            DbError::ConnectionFailed(e.to_string())
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool created"
    );

    Ok(pool)
}

/// 运行迁移并检查审计表的只追加保护
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Migration failed");
            DbError::MigrationFailed(e.to_string())
        })?;

    ensure_audit_append_only(pool).await?;

    tracing::info!("Migrations applied, audit_logs is append-only");
    Ok(())
}

async fn ensure_audit_append_only(pool: &PgPool) -> Result<(), DbError> {
    let present: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_trigger
            WHERE tgname = $1 AND tgrelid = 'audit_logs'::regclass AND tgenabled <> 'D'
        )
        "#,
    )
    .bind(APPEND_ONLY_TRIGGER)
    .fetch_one(pool)
    .await
    .map_err(|e| DbError::MigrationFailed(e.to_string()))?;

    if present {
        Ok(())
    } else {
        tracing::error!(trigger = APPEND_ONLY_TRIGGER, "audit_logs append-only trigger missing or disabled");
        Err(DbError::AuditNotAppendOnly)
    }
}

/// 一次就绪探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbProbe {
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl DbProbe {
    pub fn is_ready(&self) -> bool {
        self.error.is_none()
    }
}

/// 在 `timeout` 内执行 `SELECT 1`
pub async fn probe(pool: &PgPool, timeout: Duration) -> DbProbe {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let error = match result {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no response within {}ms", timeout.as_millis())),
    };

    match &error {
        None => tracing::debug!(latency_ms, "Database probe ok"),
        Some(e) => tracing::warn!(latency_ms, error = %e, "Database probe failed"),
    }

    DbProbe { latency_ms, error }
}

/// 记录连接池指标
pub fn record_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
    metrics::gauge!("db_pool_size").set(f64::from(size));
    metrics::gauge!("db_pool_idle").set(f64::from(idle));
    metrics::gauge!("db_pool_in_use").set(f64::from(size.saturating_sub(idle)));
}

/// 数据库错误类型
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("audit_logs is not protected by the append-only trigger")]
    AuditNotAppendOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_readiness() {
        let ok = DbProbe { latency_ms: 3, error: None };
        assert!(ok.is_ready());

        let failed = DbProbe {
            latency_ms: 2000,
            error: Some("no response within 2000ms".to_string()),
        };
        assert!(!failed.is_ready());
    }

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let config = DatabaseConfig {
            url: secrecy::Secret::new("not a url".to_string()),
            max_connections: 1,
            min_connections: 0,
            acquire_timeout_secs: 1,
            idle_timeout_secs: 1,
            max_lifetime_secs: 1,
        };
        let err = create_pool(&config).await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed(_)));
    }
}
