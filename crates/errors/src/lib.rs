//! tiercache-errors - 统一错误处理
//!
//! 错误分类：
//! - 远程存储的瞬时故障（重试后上报，或被断路器吸收）
//! - 序列化故障（直接上报，不重试）
//! - 配置故障（创建缓存时立即失败）
//! - 加载器故障（调用方提供的 loader 返回的错误）

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用错误类型
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Self::CircuitOpen(msg.into())
    }

    pub fn loader(msg: impl Into<String>) -> Self {
        Self::Loader(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 是否为可重试的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }

    /// 错误分类标识（用于日志和指标标签）
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(_) => ErrorKind::Remote,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Loader(_) => ErrorKind::Loader,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 转换为错误详情
    pub fn to_details(&self) -> ErrorDetails {
        ErrorDetails {
            kind: self.kind(),
            transient: self.is_transient(),
            detail: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Remote,
    Timeout,
    Serialization,
    Configuration,
    CircuitOpen,
    Loader,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Timeout => "timeout",
            Self::Serialization => "serialization",
            Self::Configuration => "configuration",
            Self::CircuitOpen => "circuit_open",
            Self::Loader => "loader",
            Self::Internal => "internal",
        }
    }
}

/// 错误详情
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub transient: bool,
    pub detail: String,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AppError::remote("connection reset").is_transient());
        assert!(AppError::timeout("GET took too long").is_transient());
        assert!(!AppError::serialization("bad bytes").is_transient());
        assert!(!AppError::configuration("no remote store").is_transient());
        assert!(!AppError::loader("db down").is_transient());
    }

    #[test]
    fn test_error_details() {
        let details = AppError::serialization("unexpected EOF").to_details();
        assert_eq!(details.kind, ErrorKind::Serialization);
        assert!(!details.transient);
        assert_eq!(details.detail, "Serialization error: unexpected EOF");
        assert_eq!(details.kind.as_str(), "serialization");
    }

    #[test]
    fn test_from_serde_json() {
        let err: AppError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, AppError::Serialization(_)));
    }
}
