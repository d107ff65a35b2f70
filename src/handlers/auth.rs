//! 认证相关的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::{client_context, AppState},
    models::auth::LogoutAllResponse,
};
use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};

/// 登出所有设备
pub async fn logout_all(
    State(state): State<AppState>,
    auth_context: AuthContext,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let ctx = client_context(&headers, state.config.server.trust_proxy);

    let revoked_sessions = state
        .token_authority
        .revoke_all_for_user(auth_context.user_id, auth_context.tenant_id.as_deref(), &ctx)
        .await?;

    Ok(Json(LogoutAllResponse { revoked_sessions }))
}
