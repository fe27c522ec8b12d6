//! 缓存管理器
//!
//! 进程启动时构造一次、以引用传给需要缓存的组件。按名称创建并持有缓存实例，
//! 根据 [`CacheConfig`] 组装层级和装饰器，并拥有所有共享的后台资源：
//! 过期清理任务、异步写工作池和同步引擎。
//!
//! 装饰器由外到内的顺序：布隆过滤器 -> singleflight -> 断路器 -> 热点 key -> 多级缓存

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tiercache_common::health::{AggregatedHealthResult, BaseHealthResult};
use tiercache_common::retry::RetryConfig;
use tiercache_config::{CacheConfig, CacheSettings};
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{Cache, CacheKey, CacheValue, Cached, RemoteStore, Serializer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::local::{ExpirySweep, LocalCache};
use crate::multi_level::MultiLevelCache;
use crate::protection::{
    BloomFilterCache, BloomSyncListener, CircuitBreakerCache, HotKeyCache, SimpleBloomFilter,
    SingleFlightCache,
};
use crate::remote::RemoteCache;
use crate::sweeper::ExpirySweeper;
use crate::sync::SyncManager;
use crate::worker::WorkerPool;

/// 注册表中的一项，缓存以 `Arc<dyn Cache<K, V>>` 的形式擦除类型保存
struct Registered {
    cache: Arc<dyn Any + Send + Sync>,
    multi_level: Arc<dyn Any + Send + Sync>,
    bloom: Option<Arc<SimpleBloomFilter>>,
}

impl Registered {
    fn cache<K: CacheKey, V: CacheValue>(&self, name: &str) -> AppResult<Arc<dyn Cache<K, V>>> {
        self.cache
            .downcast_ref::<Arc<dyn Cache<K, V>>>()
            .cloned()
            .ok_or_else(|| {
                AppError::configuration(format!(
                    "Cache '{}' is already registered with different key/value types",
                    name
                ))
            })
    }
}

/// [`CacheManager`] 构建器
pub struct CacheManagerBuilder {
    settings: CacheSettings,
    store: Option<Arc<dyn RemoteStore>>,
}

impl CacheManagerBuilder {
    /// 设置远程存储，不设置时只能创建本地缓存
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 启动后台任务并订阅同步频道，必须在 tokio 运行时内调用
    pub async fn build(self) -> AppResult<CacheManager> {
        let settings = self.settings;

        let shutdown = CancellationToken::new();
        let sweeper = Arc::new(ExpirySweeper::new(settings.local.sweep_interval()));
        let sweep_task = sweeper.clone().start(shutdown.clone());

        let writer = Arc::new(WorkerPool::new("async-write", settings.workers.async_write));

        let sync = match &self.store {
            Some(store) => {
                let sync = Arc::new(SyncManager::new(store.clone(), &settings.sync));
                sync.start().await?;
                Some(sync)
            }
            None => None,
        };

        info!(
            app = %settings.app_name,
            remote = self.store.as_ref().map(|s| s.backend()).unwrap_or("none"),
            "Cache manager started"
        );

        Ok(CacheManager {
            settings,
            store: self.store,
            caches: DashMap::new(),
            sweeper,
            sweep_task: Mutex::new(Some(sweep_task)),
            writer,
            sync,
            shutdown,
        })
    }
}

/// 缓存管理器
pub struct CacheManager {
    settings: CacheSettings,
    store: Option<Arc<dyn RemoteStore>>,
    caches: DashMap<String, Registered>,
    sweeper: Arc<ExpirySweeper>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    writer: Arc<WorkerPool>,
    sync: Option<Arc<SyncManager>>,
    shutdown: CancellationToken,
}

impl CacheManager {
    pub fn builder(settings: CacheSettings) -> CacheManagerBuilder {
        CacheManagerBuilder {
            settings,
            store: None,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn remote_store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.store.as_ref()
    }

    pub fn sync(&self) -> Option<&Arc<SyncManager>> {
        self.sync.as_ref()
    }

    /// 已创建的缓存名称
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    /// 获取或创建缓存，使用配置中该名称（或默认）的 [`CacheConfig`]
    pub fn get_or_create<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
    ) -> AppResult<Arc<dyn Cache<K, V>>> {
        let config = self.settings.cache_config(name);
        self.create_with(name, config, None)
    }

    /// 使用显式配置获取或创建缓存，名称已存在时忽略传入的配置
    pub fn get_or_create_with_config<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> AppResult<Arc<dyn Cache<K, V>>> {
        self.create_with(name, config, None)
    }

    /// 使用自定义序列化器获取或创建缓存
    pub fn create_with_serializer<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<Cached<V>>>,
    ) -> AppResult<Arc<dyn Cache<K, V>>> {
        let config = self.settings.cache_config(name);
        self.create_with(name, config, Some(serializer))
    }

    /// 装饰器内部的多级缓存，用于读取统计或直接访问层级
    pub fn multi_level_cache<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
    ) -> Option<Arc<MultiLevelCache<K, V>>> {
        self.caches.get(name).and_then(|entry| {
            entry
                .multi_level
                .downcast_ref::<Arc<MultiLevelCache<K, V>>>()
                .cloned()
        })
    }

    /// 开启了防穿透的缓存的布隆过滤器，用于预热合法键
    pub fn bloom_filter(&self, name: &str) -> Option<Arc<SimpleBloomFilter>> {
        self.caches.get(name).and_then(|entry| entry.bloom.clone())
    }

    fn create_with<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        config: CacheConfig,
        serializer: Option<Arc<dyn Serializer<Cached<V>>>>,
    ) -> AppResult<Arc<dyn Cache<K, V>>> {
        match self.caches.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().cache::<K, V>(name),
            Entry::Vacant(entry) => {
                let registered = self.assemble::<K, V>(name, config, serializer)?;
                let cache = registered.cache::<K, V>(name)?;
                entry.insert(registered);
                Ok(cache)
            }
        }
    }

    fn assemble<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        config: CacheConfig,
        serializer: Option<Arc<dyn Serializer<Cached<V>>>>,
    ) -> AppResult<Registered> {
        config
            .validate(name)
            .map_err(|e| AppError::configuration(e.to_string()))?;

        let needs_store = config.tier.has_remote() || config.sync_enabled;
        let store = match (&self.store, needs_store) {
            (Some(store), true) => Some(store.clone()),
            (None, true) => {
                return Err(AppError::configuration(format!(
                    "Cache '{}' requires a remote store (tier: {:?}, sync: {})",
                    name, config.tier, config.sync_enabled
                )));
            }
            (_, false) => None,
        };

        let mut multi_level = MultiLevelCache::new(name, config.clone());

        if config.tier.has_local() {
            let local = Arc::new(LocalCache::<K, V>::from_config(name, &config));
            let weak: Weak<dyn ExpirySweep> = Arc::downgrade(&local) as Weak<dyn ExpirySweep>;
            self.sweeper.register(weak);
            multi_level = multi_level.with_local(local);
        }

        if let (true, Some(store)) = (config.tier.has_remote(), store) {
            let remote_settings = &self.settings.remote;
            let remote = match serializer {
                Some(serializer) => RemoteCache::with_serializer(name, store, serializer),
                None => RemoteCache::new(name, store),
            }
            .with_key_prefix(remote_settings.key_prefix.as_deref())
            .with_retry(RetryConfig::fixed(
                remote_settings.retry.max_attempts,
                remote_settings.retry.backoff(),
            ))
            .with_default_ttl(config.ttl())
            .with_lock_ttl(remote_settings.lock_ttl());
            multi_level = multi_level.with_remote(Arc::new(remote));
        }

        if config.async_write {
            multi_level = multi_level.with_async_writer(self.writer.clone());
        }

        let sync = self.sync.as_ref().filter(|_| config.sync_enabled);
        if let Some(sync) = sync {
            multi_level = multi_level.with_sync(sync.clone());
        }

        let multi_level = Arc::new(multi_level);

        if let Some(sync) = sync {
            sync.enable_sync(name, config.sync_strategy);
            if let Some(listener) = multi_level.sync_listener() {
                sync.register_listener(name, listener);
            }
        }

        let mut cache: Arc<dyn Cache<K, V>> = multi_level.clone();

        if config.hot_key.enabled {
            cache = Arc::new(HotKeyCache::new(multi_level.clone(), &config.hot_key));
        }
        if config.circuit_breaker.enabled {
            cache = Arc::new(CircuitBreakerCache::new(
                cache,
                (&config.circuit_breaker).into(),
            ));
        }
        if config.single_flight {
            cache = Arc::new(SingleFlightCache::new(cache, config.lock_wait()));
        }

        let bloom = if config.penetration_protect {
            let filter = Arc::new(SimpleBloomFilter::new(
                config.bloom_expected_items,
                config.bloom_false_positive_rate,
            ));
            if let Some(sync) = sync {
                sync.register_listener(name, Arc::new(BloomSyncListener::new(&filter)));
            }
            cache = Arc::new(BloomFilterCache::new(cache, filter.clone()));
            Some(filter)
        } else {
            None
        };

        info!(
            cache = %name,
            tier = ?config.tier,
            ttl_secs = config.ttl_secs,
            sync = config.sync_enabled,
            bloom = config.penetration_protect,
            single_flight = config.single_flight,
            circuit_breaker = config.circuit_breaker.enabled,
            hot_key = config.hot_key.enabled,
            "Cache created"
        );

        Ok(Registered {
            cache: Arc::new(cache),
            multi_level: Arc::new(multi_level),
            bloom,
        })
    }

    /// 远程存储和同步订阅的健康状态
    pub async fn health(&self) -> AggregatedHealthResult {
        let mut result = AggregatedHealthResult::new();

        if let Some(store) = &self.store {
            let start = Instant::now();
            let timeout = self.settings.workers.shutdown_timeout();
            let check = match tokio::time::timeout(timeout, store.ping()).await {
                Ok(Ok(_)) => BaseHealthResult::healthy(start.elapsed().as_millis() as u64),
                Ok(Err(e)) => BaseHealthResult::unhealthy(e.to_string()),
                Err(_) => BaseHealthResult::timeout(),
            };
            result.add_component(format!("remote:{}", store.backend()), check);
        }

        if let Some(sync) = &self.sync {
            let check = if sync.is_subscribed() {
                BaseHealthResult::healthy(0)
            } else {
                BaseHealthResult::unhealthy("Sync subscription is not active")
            };
            result.add_component("sync", check);
        }

        debug!(
            healthy = result.healthy,
            components = result.total_count(),
            "Cache health checked"
        );
        result
    }

    /// 停止清理任务和同步订阅，在超时内尽量排空工作池
    pub async fn shutdown(&self) {
        let timeout = self.settings.workers.shutdown_timeout();
        info!(timeout_ms = timeout.as_millis() as u64, "Cache manager shutting down");

        self.shutdown.cancel();
        let sweep_task = self.sweep_task.lock().take();
        if let Some(task) = sweep_task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!("Expiry sweeper did not stop in time");
            }
        }

        if let Some(sync) = &self.sync {
            sync.shutdown(timeout).await;
        }
        self.writer.shutdown(timeout).await;

        info!("Cache manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::time::Duration;
    use tiercache_config::TierKind;
    use tiercache_ports::loader;

    fn settings() -> CacheSettings {
        let mut settings = CacheSettings::default();
        settings
            .caches
            .insert("local".to_string(), CacheConfig::local(10));
        settings
    }

    async fn manager_with_store() -> (Arc<MemoryStore>, CacheManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = CacheManager::builder(settings())
            .remote_store(store.clone())
            .build()
            .await
            .unwrap();
        (store, manager)
    }

    #[tokio::test]
    async fn test_local_cache_without_store() {
        let manager = CacheManager::builder(settings()).build().await.unwrap();
        let cache = manager.get_or_create::<String, String>("local").unwrap();
        cache.put(&"k".to_string(), "v".to_string()).await.unwrap();
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some("v".to_string()));
        assert!(manager.sync().is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_tier_without_store_fails_fast() {
        let manager = CacheManager::builder(settings()).build().await.unwrap();
        let err = manager
            .get_or_create::<String, String>("orders")
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Configuration(_)));
        assert!(manager.cache_names().is_empty());
    }

    #[tokio::test]
    async fn test_same_name_returns_shared_instance() {
        let (_store, manager) = manager_with_store().await;
        let a = manager.get_or_create::<String, u64>("counters").unwrap();
        let b = manager.get_or_create::<String, u64>("counters").unwrap();

        a.put(&"k".to_string(), 7).await.unwrap();
        assert_eq!(b.get(&"k".to_string()).await.unwrap(), Some(7));
        assert_eq!(manager.cache_names(), vec!["counters".to_string()]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_configuration_error() {
        let (_store, manager) = manager_with_store().await;
        manager.get_or_create::<String, u64>("typed").unwrap();
        let err = manager
            .get_or_create::<String, String>("typed")
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (_store, manager) = manager_with_store().await;
        let config = CacheConfig {
            tier: TierKind::Local,
            max_local_size: 0,
            ..Default::default()
        };
        let err = manager
            .get_or_create_with_config::<String, String>("broken", config)
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_remote_keys_use_configured_prefix() {
        let store = Arc::new(MemoryStore::new());
        let mut settings = settings();
        settings.remote.key_prefix = Some("app:".to_string());
        let manager = CacheManager::builder(settings)
            .remote_store(store.clone())
            .build()
            .await
            .unwrap();

        let cache = manager.get_or_create::<String, String>("users").unwrap();
        cache.put(&"u1".to_string(), "alice".to_string()).await.unwrap();

        let keys = store.keys_matching("app:users:*").await.unwrap();
        assert_eq!(keys, vec!["app:users:u1".to_string()]);
    }

    #[tokio::test]
    async fn test_multi_level_handle_exposes_stats() {
        let (_store, manager) = manager_with_store().await;
        let cache = manager.get_or_create::<String, String>("stats").unwrap();
        cache
            .get_or_load(&"k".to_string(), loader(|| async { Ok(Some("v".to_string())) }))
            .await
            .unwrap();
        cache.get(&"k".to_string()).await.unwrap();

        let inner = manager.multi_level_cache::<String, String>("stats").unwrap();
        let stats = inner.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.local_hits, 1);
        assert!(manager.multi_level_cache::<String, u64>("stats").is_none());
    }

    #[tokio::test]
    async fn test_bloom_filter_exposed_when_enabled() {
        let (_store, manager) = manager_with_store().await;
        let config = CacheConfig {
            penetration_protect: true,
            bloom_expected_items: 1000,
            ..Default::default()
        };
        let cache = manager
            .get_or_create_with_config::<String, String>("guarded", config)
            .unwrap();
        let filter = manager.bloom_filter("guarded").unwrap();

        assert_eq!(cache.get(&"ghost".to_string()).await.unwrap(), None);
        cache.put(&"real".to_string(), "v".to_string()).await.unwrap();
        assert!(filter.might_contain("real"));
        assert!(manager.bloom_filter("stats").is_none());
    }

    #[tokio::test]
    async fn test_health_reports_store_and_sync() {
        let (store, manager) = manager_with_store().await;
        let health = manager.health().await;
        assert!(health.healthy);
        assert_eq!(health.total_count(), 2);

        store.set_failing(true);
        let health = manager.health().await;
        assert!(!health.healthy);
        assert_eq!(health.healthy_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sync_subscription() {
        let (_store, manager) = manager_with_store().await;
        assert!(manager.sync().unwrap().is_subscribed());

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .unwrap();
        assert!(!manager.sync().unwrap().is_subscribed());
    }
}
