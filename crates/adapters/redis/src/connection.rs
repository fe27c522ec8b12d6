//! Redis 连接管理和错误映射

use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use tiercache_errors::{AppError, AppResult};

use crate::config::RedisStoreConfig;

/// 创建 Redis 客户端
pub fn create_client(url: &str) -> AppResult<Client> {
    Client::open(url)
        .map_err(|e| AppError::configuration(format!("Invalid Redis URL: {}", e)))
}

/// 创建 Redis 连接管理器，断线后自动重连
pub async fn create_connection_manager(
    client: &Client,
    config: &RedisStoreConfig,
) -> AppResult<ConnectionManager> {
    tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client.clone()))
        .await
        .map_err(|_| {
            AppError::timeout(format!(
                "Redis connection not established within {}ms",
                config.connection_timeout.as_millis()
            ))
        })?
        .map_err(|e| map_redis_error("connect", e))
}

/// 把 Redis 错误映射为应用错误
///
/// 超时 -> `Timeout`，类型不匹配 -> `Serialization`，其余（IO、断连、服务端错误）-> `Remote`
pub fn map_redis_error(operation: &str, err: RedisError) -> AppError {
    if err.is_timeout() {
        AppError::timeout(format!("Redis {} timed out: {}", operation, err))
    } else if err.kind() == ErrorKind::TypeError {
        AppError::serialization(format!("Redis {} returned unexpected type: {}", operation, err))
    } else {
        AppError::remote(format!("Redis {} failed: {}", operation, err))
    }
}
