//! 数据模型模块
//! 会话、身份目录、审计链与令牌授予相关模型

pub mod audit;
pub mod auth;
pub mod directory;
pub mod session;

/// 数据库中的文本枚举值无法识别
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
