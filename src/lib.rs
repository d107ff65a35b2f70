//! 多租户安全核心
//! 令牌/会话签发与吊销、登录锁定、MFA 挑战，以及按租户的审计哈希链

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
