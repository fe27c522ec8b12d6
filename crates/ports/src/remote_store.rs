//! 远程存储协作者接口
//!
//! 远程层和同步引擎对底层共享 KV 存储的全部依赖

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_errors::AppResult;
use tokio::task::JoinHandle;

/// 订阅消息处理器：(频道, 负载)
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// 远程存储 trait
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 存储实现名称（用于日志和健康检查）
    fn backend(&self) -> &'static str;

    /// 获取值
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>>;

    /// 设置值，`None` 表示不过期
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> AppResult<()>;

    /// 删除，返回键是否存在
    async fn delete(&self, key: &str) -> AppResult<bool>;

    /// 检查是否存在
    async fn exists(&self, key: &str) -> AppResult<bool>;

    /// 批量获取（一次往返），只返回存在的键
    async fn multi_get(&self, keys: &[String]) -> AppResult<HashMap<String, Vec<u8>>>;

    /// 批量设置（一次往返）
    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> AppResult<()>;

    /// 批量删除，返回实际删除的数量
    async fn multi_delete(&self, keys: &[String]) -> AppResult<u64>;

    /// 按 glob 模式列出键
    async fn keys_matching(&self, pattern: &str) -> AppResult<Vec<String>>;

    /// 键不存在时设置（锁原语）
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> AppResult<bool>;

    /// 值匹配时删除（锁释放）
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> AppResult<bool>;

    /// 发布消息
    async fn publish(&self, channel: &str, payload: &[u8]) -> AppResult<()>;

    /// 按模式订阅，消息在后台任务中交给 handler
    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> AppResult<Subscription>;

    /// 连通性检查，返回往返耗时
    async fn ping(&self) -> AppResult<Duration>;
}

/// 订阅句柄，丢弃或取消时停止接收
pub struct Subscription {
    pattern: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            pattern: pattern.into(),
            handle,
        }
    }

    /// 订阅的模式
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// 接收任务是否仍在运行
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 取消订阅
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
