//! Redis 存储配置

use std::time::Duration;

/// Redis 存储配置
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub url: String,
    /// 建立连接超时
    pub connection_timeout: Duration,
    /// 单条命令（含流水线）的响应超时
    pub response_timeout: Duration,
    /// SCAN 每批返回数量的提示值
    pub scan_count: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(2),
            scan_count: 500,
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.response_timeout, Duration::from_secs(2));
        assert_eq!(config.scan_count, 500);
    }

    #[test]
    fn test_config_builder() {
        let config = RedisStoreConfig::new("redis://cache:6379/2")
            .with_connection_timeout(Duration::from_secs(1))
            .with_response_timeout(Duration::from_millis(300))
            .with_scan_count(0);

        assert_eq!(config.url, "redis://cache:6379/2");
        assert_eq!(config.connection_timeout, Duration::from_secs(1));
        assert_eq!(config.response_timeout, Duration::from_millis(300));
        assert_eq!(config.scan_count, 1);
    }
}
