//! 缓存同步事件

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tiercache_errors::AppResult;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEventType {
    Put,
    Remove,
    Clear,
}

impl CacheEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Remove => "remove",
            Self::Clear => "clear",
        }
    }
}

/// 同步策略
///
/// 跨进程的消息顺序没有保证：`Invalidate` 在乱序下更安全，
/// `Update` 可能让本地层持有比之前失效更旧的值
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// 删除本地条目，下次读取回源远程层
    #[default]
    Invalidate,
    /// 直接把事件中的值写入本地层
    Update,
}

/// 缓存变更事件（线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvent {
    /// 缓存名称
    pub cache_name: String,
    /// 键，Clear 事件为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// 远程层序列化后的值，仅 Put 事件携带
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    /// 事件类型
    pub event_type: CacheEventType,
    /// 时间戳（Unix 毫秒）
    pub timestamp: i64,
    /// 发布者实例 ID
    #[serde(default)]
    pub source: String,
}

impl CacheEvent {
    pub fn put(
        cache_name: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(cache_name, Some(key.into()), Some(value), CacheEventType::Put, source)
    }

    pub fn remove(
        cache_name: impl Into<String>,
        key: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(cache_name, Some(key.into()), None, CacheEventType::Remove, source)
    }

    pub fn clear(cache_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(cache_name, None, None, CacheEventType::Clear, source)
    }

    fn new(
        cache_name: impl Into<String>,
        key: Option<String>,
        value: Option<Vec<u8>>,
        event_type: CacheEventType,
        source: impl Into<String>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            value,
            event_type,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }
}

/// 缓存事件监听器 trait
#[async_trait]
pub trait CacheEventListener: Send + Sync {
    /// 处理事件，`strategy` 为该缓存当前的同步策略
    async fn on_event(&self, event: &CacheEvent, strategy: SyncStrategy) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = CacheEvent::remove("orders", "o1", "node-a");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["cacheName"], "orders");
        assert_eq!(json["key"], "o1");
        assert_eq!(json["eventType"], "REMOVE");
        assert!(json.get("value").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_event_without_source_is_accepted() {
        let raw = r#"{"cacheName":"orders","eventType":"CLEAR","timestamp":1}"#;
        let event: CacheEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, CacheEventType::Clear);
        assert!(event.key.is_none());
        assert!(event.source.is_empty());
    }

    #[test]
    fn test_strategy_default() {
        assert_eq!(SyncStrategy::default(), SyncStrategy::Invalidate);
        let parsed: SyncStrategy = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(parsed, SyncStrategy::Update);
    }
}
