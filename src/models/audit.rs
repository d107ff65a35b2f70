//! Audit domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 审计事件分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Authorization,
    Session,
    Audit,
    DataAccess,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::Authorization => "authorization",
            AuditCategory::Session => "session",
            AuditCategory::Audit => "audit",
            AuditCategory::DataAccess => "data_access",
        }
    }
}

/// 安全相关审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    AccountLocked,
    MfaChallengeIssued,
    MfaFailure,
    TokenRefreshed,
    TokenRevoked,
    SessionsRevoked,
    PermissionDenied,
    ChainVerified,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSuccess => "auth.login.success",
            AuditEventType::LoginFailure => "auth.login.failure",
            AuditEventType::AccountLocked => "auth.account.locked",
            AuditEventType::MfaChallengeIssued => "auth.mfa.challenge",
            AuditEventType::MfaFailure => "auth.mfa.failure",
            AuditEventType::TokenRefreshed => "token.refreshed",
            AuditEventType::TokenRevoked => "token.revoked",
            AuditEventType::SessionsRevoked => "session.revoked_all",
            AuditEventType::PermissionDenied => "access.permission_denied",
            AuditEventType::ChainVerified => "audit.chain.verified",
        }
    }

    pub fn category(&self) -> AuditCategory {
        match self {
            AuditEventType::LoginSuccess
            | AuditEventType::LoginFailure
            | AuditEventType::AccountLocked
            | AuditEventType::MfaChallengeIssued
            | AuditEventType::MfaFailure => AuditCategory::Authentication,
            AuditEventType::TokenRefreshed
            | AuditEventType::TokenRevoked
            | AuditEventType::SessionsRevoked => AuditCategory::Session,
            AuditEventType::PermissionDenied => AuditCategory::Authorization,
            AuditEventType::ChainVerified => AuditCategory::Audit,
        }
    }
}

/// Event content supplied by callers; the writer assigns id, sequence, timestamp and hashes.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub event_type: String,
    pub category: String,
    pub user_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, action: impl Into<String>) -> Self {
        Self::custom(event_type.as_str(), event_type.category(), action)
    }

    /// Event types owned by the surrounding application (PHI access and the like)
    pub fn custom(event_type: &str, category: AuditCategory, action: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            category: category.as_str().to_string(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: Option<Uuid>, user_name: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.user_name = Some(user_name.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Hash-linked audit log entry. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub tenant_id: String,
    /// 租户内从 1 开始的插入序号，决定链顺序
    pub sequence: i64,
    pub event_type: String,
    pub category: String,
    pub user_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub hash: String,
    pub previous_hash: String,
}

/// Result of walking a tenant's chain over a time range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub verified: bool,
    pub chain_intact: bool,
    pub entries_checked: u64,
    pub verified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken_entry: Option<Uuid>,
}

/// Audit log filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditLogFilters {
    pub event_type: Option<String>,
    pub category: Option<String>,
    pub user_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditLogFilters {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.event_type.as_ref().map_or(true, |t| &entry.event_type == t)
            && self.category.as_ref().map_or(true, |c| &entry.category == c)
            && self.user_id.map_or(true, |u| entry.user_id == Some(u))
            && self.start_time.map_or(true, |s| entry.timestamp >= s)
            && self.end_time.map_or(true, |e| entry.timestamp <= e)
    }
}
