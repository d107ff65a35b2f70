//! 统一错误模型
//! 定义所有错误类型、稳定错误码与 HTTP 状态映射

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 用户不存在或密码错误（对调用方不可区分）
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Account is locked")]
    AccountLocked,

    #[error("Password has expired")]
    PasswordExpired,

    /// 租户或成员关系不存在/未激活
    #[error("Tenant is not active")]
    TenantInactive,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    /// 挑战令牌未知、过期或已被使用
    #[error("Invalid or expired MFA challenge")]
    InvalidMfaChallenge,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Unsupported grant: {0}")]
    InvalidGrant(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidCredentials
            | AppError::InvalidMfaCode
            | AppError::InvalidMfaChallenge
            | AppError::InvalidToken
            | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::AccountLocked => StatusCode::LOCKED,
            AppError::PasswordExpired | AppError::TenantInactive | AppError::Forbidden => {
                StatusCode::FORBIDDEN
            }
            AppError::InvalidGrant(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::AccountLocked => "ACCOUNT_LOCKED",
            AppError::PasswordExpired => "PASSWORD_EXPIRED",
            AppError::TenantInactive => "TENANT_INACTIVE",
            AppError::InvalidMfaCode => "INVALID_MFA_CODE",
            AppError::InvalidMfaChallenge => "INVALID_MFA_CHALLENGE",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::InvalidGrant(_) => "INVALID_GRANT",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Config(_)
            | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::InvalidGrant(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::Timeout(_) => "Upstream operation timed out".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Cache(_) | AppError::Config(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                status: status.as_u16(),
                message: self.user_message(),
                request_id,
            },
        };

        if self.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::AccountLocked.status_code(), StatusCode::LOCKED);
        assert_eq!(AppError::TenantInactive.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::InvalidGrant("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Timeout("cache".into()).code(), "TIMEOUT");
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));

        let error = AppError::Internal("argon2 params rejected".to_string());
        assert!(!error.user_message().contains("argon2"));
    }
}
