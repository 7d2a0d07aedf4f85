//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调引擎的错误类型和处理机制。

use thiserror::Error;

/// 缓存协调错误类型枚举
///
/// 错误实现了 `Clone`，同一次加载的结果（包括错误）可以同时交给所有等待者。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// 配置错误，构造阶段即失败，不重试
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 非法参数（空键、拒绝空值的缓存收到空值、非正容量等），在访问存储之前拒绝
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 加载器执行失败
    #[error("Load failed for key '{key}': {message}")]
    LoadFailure { key: String, message: String },

    /// 锁未能在限定时间内获取，或重试预算耗尽
    #[error("Coordination timeout: {0}")]
    CoordinationTimeout(String),

    /// 序列化错误（存储中的数据无法解析）
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 映射检出失败：部分条目已被其他消费者占用
    #[error("Entries of '{map_key}' are consumed already: {keys:?}")]
    Consumed { map_key: String, keys: Vec<String> },

    /// 存储后端操作失败
    #[error("Substrate operation failed: {0}")]
    Substrate(String),

    /// 存储命令超时
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(String),
}

impl CacheError {
    /// 将加载器返回的错误转换为缓存错误
    ///
    /// 如果错误链中本身就是 `CacheError`（例如加载器内部调用了另一个缓存），原样返回；
    /// 否则包装为 `LoadFailure`。
    pub fn from_loader(key: &str, err: anyhow::Error) -> Self {
        match err.downcast_ref::<CacheError>() {
            Some(inner) => inner.clone(),
            None => CacheError::LoadFailure {
                key: key.to_string(),
                message: format!("{:#}", err),
            },
        }
    }

    /// 是否为协调超时
    pub fn is_coordination_timeout(&self) -> bool {
        matches!(self, CacheError::CoordinationTimeout(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(err.to_string())
        } else {
            CacheError::Substrate(err.to_string())
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        CacheError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// 缓存操作结果类型别名
///
/// 简化错误处理，所有协调操作都返回此类型
pub type Result<T> = std::result::Result<T, CacheError>;
