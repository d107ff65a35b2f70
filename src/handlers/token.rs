//! OAuth 风格的令牌端点

use crate::{
    auth::middleware::MaybeAuth,
    error::AppError,
    middleware::{client_context, AppState},
    models::auth::{GrantRequest, RevokeRequest},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};

/// 令牌响应不得被缓存
const NO_STORE: [(header::HeaderName, &str); 2] = [
    (header::CACHE_CONTROL, "no-store"),
    (header::PRAGMA, "no-cache"),
];

/// POST /oauth/token
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let grant = GrantRequest::parse(body)?;

    let ctx = client_context(&headers, state.config.server.trust_proxy);
    let outcome = state.token_authority.issue_tokens(grant, &ctx).await?;

    Ok((NO_STORE, Json(outcome)))
}

/// POST /oauth/revoke
///
/// 未知令牌同样返回 `{revoked: true}`。
pub async fn revoke(
    State(state): State<AppState>,
    MaybeAuth(auth_context): MaybeAuth,
    headers: HeaderMap,
    body: Result<Json<RevokeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let ctx = client_context(&headers, state.config.server.trust_proxy);
    let response = state
        .token_authority
        .revoke(
            &req.token,
            req.hint(),
            auth_context.map(|a| a.user_id),
            &ctx,
        )
        .await?;

    Ok(Json(response))
}
