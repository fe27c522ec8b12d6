//! 跨实例同步引擎
//!
//! 远程写/删/清空成功后在 `<prefix><cacheName>` 频道发布事件；每个进程用一个通配订阅
//! 接收所有缓存的事件，交给按名称注册的监听器和全局（`*`）监听器处理。
//!
//! 发布和分发都在后台工作池中执行，按缓存名固定到同一个工作者，同一个缓存的事件
//! 按发布顺序送达监听器。失败只记录日志，不重试

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tiercache_config::SyncSettings;
use tiercache_errors::AppResult;
use tiercache_ports::{
    CacheEvent, CacheEventListener, JsonSerializer, MessageHandler, RemoteStore, Serializer,
    Subscription, SyncStrategy,
};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::worker::WorkerPool;

/// 全局监听器的注册名
pub const ALL_CACHES: &str = "*";

/// 单个缓存的同步配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub enabled: bool,
    pub strategy: SyncStrategy,
}

/// 同步引擎
pub struct SyncManager {
    store: Arc<dyn RemoteStore>,
    instance_id: String,
    channel_prefix: String,
    configs: DashMap<String, SyncConfig>,
    listeners: DashMap<String, Vec<Arc<dyn CacheEventListener>>>,
    publisher: WorkerPool,
    dispatcher: WorkerPool,
    codec: JsonSerializer<CacheEvent>,
    subscription: Mutex<Option<Subscription>>,
}

impl SyncManager {
    /// 创建同步引擎，必须在 tokio 运行时内调用
    pub fn new(store: Arc<dyn RemoteStore>, settings: &SyncSettings) -> Self {
        let instance_id = tiercache_common::utils::random_id().to_string();
        info!(instance_id = %instance_id, prefix = %settings.channel_prefix, "Sync manager created");

        Self {
            store,
            instance_id,
            channel_prefix: settings.channel_prefix.clone(),
            configs: DashMap::new(),
            listeners: DashMap::new(),
            publisher: WorkerPool::new("sync-publish", settings.publish_workers),
            dispatcher: WorkerPool::new("sync-dispatch", settings.dispatch_workers),
            codec: JsonSerializer::new(),
            subscription: Mutex::new(None),
        }
    }

    /// 本进程实例 ID，作为事件的 `source`
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 缓存对应的频道名
    pub fn channel(&self, cache_name: &str) -> String {
        format!("{}{}", self.channel_prefix, cache_name)
    }

    /// 开启或更新同步配置
    pub fn enable_sync(&self, cache_name: &str, strategy: SyncStrategy) {
        self.configs.insert(
            cache_name.to_string(),
            SyncConfig {
                enabled: true,
                strategy,
            },
        );
        debug!(cache = %cache_name, ?strategy, "Sync enabled");
    }

    pub fn disable_sync(&self, cache_name: &str) {
        if let Some(mut config) = self.configs.get_mut(cache_name) {
            config.enabled = false;
        }
    }

    pub fn sync_config(&self, cache_name: &str) -> Option<SyncConfig> {
        self.configs.get(cache_name).map(|c| *c)
    }

    pub fn is_enabled(&self, cache_name: &str) -> bool {
        self.sync_config(cache_name).is_some_and(|c| c.enabled)
    }

    /// 注册监听器，`cache_name` 为 [`ALL_CACHES`] 时接收所有缓存的事件
    pub fn register_listener(&self, cache_name: &str, listener: Arc<dyn CacheEventListener>) {
        self.listeners
            .entry(cache_name.to_string())
            .or_default()
            .push(listener);
    }

    /// 发布事件（异步，不阻塞调用方）。未开启同步的缓存不发布
    pub fn publish(&self, event: CacheEvent) {
        if !self.is_enabled(&event.cache_name) {
            return;
        }

        let payload = match self.codec.serialize(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(cache = %event.cache_name, error = %e, "Failed to encode cache event");
                return;
            }
        };

        let store = self.store.clone();
        let channel = self.channel(&event.cache_name);
        let cache_name = event.cache_name;
        let event_type = event.event_type.as_str();
        let shard = cache_name.clone();
        self.publisher.submit_keyed(&shard, async move {
            match store.publish(&channel, &payload).await {
                Ok(()) => metrics::record_sync_event(&cache_name, "published", event_type),
                Err(e) => {
                    error!(cache = %cache_name, channel = %channel, error = %e, "Failed to publish cache event");
                }
            }
        });
    }

    pub fn publish_put(&self, cache_name: &str, key: String, value: Vec<u8>) {
        self.publish(CacheEvent::put(cache_name, key, value, self.instance_id.as_str()));
    }

    pub fn publish_remove(&self, cache_name: &str, key: String) {
        self.publish(CacheEvent::remove(cache_name, key, self.instance_id.as_str()));
    }

    pub fn publish_clear(&self, cache_name: &str) {
        self.publish(CacheEvent::clear(cache_name, self.instance_id.as_str()));
    }

    /// 建立通配订阅，重复调用无副作用
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.subscription.lock().is_some() {
            return Ok(());
        }

        let pattern = format!("{}*", self.channel_prefix);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |channel: String, payload: Vec<u8>| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_message(&channel, &payload);
            }
        });

        let subscription = self.store.subscribe(&pattern, handler).await?;
        info!(pattern = %pattern, backend = self.store.backend(), "Sync subscription started");
        *self.subscription.lock() = Some(subscription);
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// 处理收到的消息：解码、过滤后交给分发池
    pub(crate) fn handle_message(&self, channel: &str, payload: &[u8]) {
        let event = match self.codec.deserialize(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping malformed cache event");
                return;
            }
        };

        if event.source == self.instance_id {
            return;
        }

        let event_type = event.event_type.as_str();
        let Some(config) = self.sync_config(&event.cache_name).filter(|c| c.enabled) else {
            debug!(cache = %event.cache_name, "Ignoring event for cache without sync");
            metrics::record_sync_event(&event.cache_name, "dropped", event_type);
            return;
        };

        let mut listeners: Vec<Arc<dyn CacheEventListener>> = Vec::new();
        if let Some(named) = self.listeners.get(&event.cache_name) {
            listeners.extend(named.iter().cloned());
        }
        if let Some(global) = self.listeners.get(ALL_CACHES) {
            listeners.extend(global.iter().cloned());
        }
        if listeners.is_empty() {
            return;
        }

        metrics::record_sync_event(&event.cache_name, "received", event_type);
        let shard = event.cache_name.clone();
        self.dispatcher.submit_keyed(&shard, async move {
            for listener in listeners {
                if let Err(e) = listener.on_event(&event, config.strategy).await {
                    warn!(
                        cache = %event.cache_name,
                        event_type,
                        error = %e,
                        "Cache event listener failed"
                    );
                }
            }
        });
    }

    /// 取消订阅并排空发布/分发池
    pub async fn shutdown(&self, timeout: Duration) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        self.publisher.shutdown(timeout).await;
        self.dispatcher.shutdown(timeout).await;
        info!(instance_id = %self.instance_id, "Sync manager stopped");
    }
}
