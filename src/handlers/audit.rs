//! 审计日志的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::{client_context, AppState},
    models::audit::*,
};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub event_type: Option<String>,
    pub category: Option<String>,
    pub user_id: Option<uuid::Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// 权限不足时先写审计再拒绝
async fn require_permission(
    state: &AppState,
    auth_context: &AuthContext,
    permission: &str,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    if let Err(e) = auth_context.require_permission(permission) {
        let ctx = client_context(headers, state.config.server.trust_proxy);
        state
            .audit_service
            .record(
                auth_context.tenant_id.as_deref(),
                AuditEvent::new(AuditEventType::PermissionDenied, "access")
                    .user(Some(auth_context.user_id), &auth_context.username)
                    .resource("permission", permission)
                    .client(ctx.ip, ctx.user_agent),
            )
            .await;
        return Err(e);
    }
    Ok(())
}

/// 校验当前租户的审计链
pub async fn verify_chain(
    State(state): State<AppState>,
    auth_context: AuthContext,
    headers: HeaderMap,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    require_permission(&state, &auth_context, "audit:verify", &headers).await?;
    let tenant_id = auth_context.require_tenant()?;
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let result = state
        .audit_service
        .verify(tenant_id, query.start_date, query.end_date)
        .await?;

    state
        .audit_service
        .record(
            Some(tenant_id),
            AuditEvent::new(AuditEventType::ChainVerified, "verify")
                .user(Some(auth_context.user_id), &auth_context.username)
                .details(json!({
                    "chain_intact": result.chain_intact,
                    "entries_checked": result.entries_checked,
                })),
        )
        .await;

    Ok(Json(result))
}

/// 查询当前租户的审计日志
pub async fn list_audit_logs(
    State(state): State<AppState>,
    auth_context: AuthContext,
    headers: HeaderMap,
    query: Result<Query<AuditLogQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    require_permission(&state, &auth_context, "audit:read", &headers).await?;
    let tenant_id = auth_context.require_tenant()?;
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let filters = AuditLogFilters {
        event_type: query.event_type,
        category: query.category,
        user_id: query.user_id,
        start_time: query.start_time,
        end_time: query.end_time,
    };
    let limit = query.limit.clamp(1, MAX_LIMIT);
    let offset = query.offset.max(0);

    let (logs, total) = state
        .audit_service
        .query(tenant_id, &filters, limit, offset)
        .await?;

    Ok(Json(json!({
        "logs": logs,
        "count": logs.len(),
        "total": total
    })))
}
