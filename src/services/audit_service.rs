//! Audit service
//!
//! 每个租户一条哈希链。读链尾、计算哈希、写入由存储层作为一个原子单元完成，
//! 多实例共享同一存储时也不会分叉；进程内的租户锁只是减少存储层争用。
//! 不同租户之间互不阻塞。校验只读。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::audit_chain::{compute_hash, link_entry, truncate_to_millis, GENESIS_HASH};
use crate::{
    clock::Clock,
    error::AppError,
    models::audit::{AuditEvent, AuditLogEntry, AuditLogFilters, ChainVerification},
    repository::AuditRepository,
};

pub struct AuditService {
    repo: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AuditService {
    pub fn new(repo: Arc<dyn AuditRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            tenant_locks: DashMap::new(),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 追加审计条目并链接到租户链尾
    pub async fn append(&self, tenant_id: &str, event: AuditEvent) -> Result<AuditLogEntry, AppError> {
        if tenant_id.is_empty() {
            return Err(AppError::BadRequest("tenant_id is required".to_string()));
        }

        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let draft = AuditLogEntry {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            sequence: 0,
            event_type: event.event_type,
            category: event.category,
            user_id: event.user_id,
            user_name: event.user_name,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            action: event.action,
            ip: event.ip,
            user_agent: event.user_agent,
            details: event.details,
            timestamp: truncate_to_millis(self.clock.now()),
            hash: String::new(),
            previous_hash: String::new(),
        };

        let link = |tail: Option<&AuditLogEntry>| link_entry(&draft, tail);
        let entry = self.repo.append_linked(tenant_id, &link).await?;

        metrics::counter!("audit_appends_total").increment(1);
        tracing::debug!(
            tenant_id = %entry.tenant_id,
            sequence = entry.sequence,
            event_type = %entry.event_type,
            "Audit entry appended"
        );

        Ok(entry)
    }

    /// 尽力记录：失败只写日志，不影响调用方
    pub async fn record(&self, tenant_id: Option<&str>, event: AuditEvent) {
        let Some(tenant_id) = tenant_id.filter(|t| !t.is_empty()) else {
            tracing::debug!(
                event_type = %event.event_type,
                "Audit event without tenant skipped"
            );
            return;
        };

        if let Err(e) = self.append(tenant_id, event).await {
            tracing::warn!(tenant_id = %tenant_id, error = %e, "Failed to append audit entry");
        }
    }

    /// 校验租户链在 [start, end] 区间内的完整性
    pub async fn verify(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ChainVerification, AppError> {
        if start > end {
            return Err(AppError::BadRequest(
                "start_date must not be after end_date".to_string(),
            ));
        }

        let entries = self.repo.range(tenant_id, start, end).await?;

        // 区间不含链首时，以前一条目的哈希为锚点；前一条目缺失即断链
        let mut expected_previous = match entries.first() {
            Some(first) if first.sequence > 1 => self
                .repo
                .by_sequence(tenant_id, first.sequence - 1)
                .await?
                .map(|prev| prev.hash),
            _ => Some(GENESIS_HASH.to_string()),
        };

        let mut first_broken_entry = None;
        let mut entries_checked = 0u64;

        for entry in &entries {
            entries_checked += 1;

            let link_ok = expected_previous.as_deref() == Some(entry.previous_hash.as_str());
            let hash_ok = compute_hash(entry, &entry.previous_hash) == entry.hash;

            if !(link_ok && hash_ok) && first_broken_entry.is_none() {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    entry_id = %entry.id,
                    sequence = entry.sequence,
                    link_ok,
                    hash_ok,
                    "Audit chain break detected"
                );
                first_broken_entry = Some(entry.id);
            }

            expected_previous = Some(entry.hash.clone());
        }

        let intact = first_broken_entry.is_none();

        tracing::info!(
            tenant_id = %tenant_id,
            entries_checked,
            intact,
            "Audit chain verified"
        );

        Ok(ChainVerification {
            verified: intact,
            chain_intact: intact,
            entries_checked,
            verified_at: self.clock.now(),
            first_broken_entry,
        })
    }

    /// 查询审计日志（租户隔离），返回 (条目, 总数)
    pub async fn query(
        &self,
        tenant_id: &str,
        filters: &AuditLogFilters,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLogEntry>, i64), AppError> {
        let logs = self.repo.query(tenant_id, filters, limit, offset).await?;
        let total = self.repo.count(tenant_id, filters).await?;
        Ok((logs, total))
    }
}
