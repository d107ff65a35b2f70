//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    auth::middleware::{bearer_auth_middleware, optional_auth_middleware},
    handlers,
    middleware::{request_tracking_middleware, AppState},
};

/// 请求体上限，令牌与吊销请求都很小
const MAX_BODY_BYTES: usize = 16 * 1024;

/// 创建应用路由
pub fn create_router(state: AppState) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 令牌端点（无需认证）
    let token_routes = Router::new().route("/oauth/token", post(handlers::token::token));

    // 吊销端点（可选认证，用于限定只能吊销自己的令牌）
    let revoke_routes = Router::new()
        .route("/oauth/revoke", post(handlers::token::revoke))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            optional_auth_middleware,
        ));

    // 需要认证的路由
    let authenticated_routes = Router::new()
        .route("/api/v1/auth/logout-all", post(handlers::auth::logout_all))
        // 审计日志（需要审计权限）
        .route("/api/v1/audit/verify", get(handlers::audit::verify_chain))
        .route("/api/v1/audit/logs", get(handlers::audit::list_audit_logs))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(token_routes)
        .merge(revoke_routes)
        .merge(authenticated_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_tracking_middleware)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
