//! 热点 key 提升
//!
//! 按 key 统计时间窗口内的访问次数，计数器放在短 TTL 的 moka 缓存中，条目过期即重置窗口。
//! 访问次数超过阈值的 key 在写入和读取后以 `local_expire` 固定到本地层。
//! 只能包装 [`MultiLevelCache`]，因为需要直接访问本地层

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache as MokaCache;
use tiercache_config::HotKeySettings;
use tiercache_errors::AppResult;
use tiercache_ports::{Cache, CacheKey, CacheValue, Cached, Loader};
use tracing::debug;

use crate::multi_level::MultiLevelCache;

/// 热点 key 装饰器
pub struct HotKeyCache<K: CacheKey, V: CacheValue> {
    inner: Arc<MultiLevelCache<K, V>>,
    counters: MokaCache<K, Arc<AtomicU64>>,
    threshold: u64,
    local_expire: Duration,
}

impl<K: CacheKey, V: CacheValue> HotKeyCache<K, V> {
    pub fn new(inner: Arc<MultiLevelCache<K, V>>, settings: &HotKeySettings) -> Self {
        let counters = MokaCache::builder()
            .max_capacity(inner.config().max_local_size.max(1) as u64 * 4)
            .time_to_live(settings.time_window())
            .build();

        Self {
            inner,
            counters,
            threshold: settings.threshold,
            local_expire: settings.local_expire(),
        }
    }

    /// 记录一次访问，返回窗口内的访问次数
    fn record_access(&self, key: &K) -> u64 {
        let counter = self
            .counters
            .get_with(key.clone(), || Arc::new(AtomicU64::new(0)));
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 当前窗口内的访问次数
    pub fn access_count(&self, key: &K) -> u64 {
        self.counters
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn is_hot(&self, key: &K) -> bool {
        self.access_count(key) > self.threshold
    }

    fn pin(&self, key: &K, value: &V) {
        if let Some(local) = self.inner.local() {
            local.store(key.clone(), Cached::Value(value.clone()), Some(self.local_expire));
            debug!(cache = %self.inner.name(), key = %key, "Hot key pinned to local tier");
        }
    }

    fn pin_if_hot(&self, key: &K, value: &Option<V>, count: u64) {
        if count > self.threshold {
            if let Some(value) = value {
                self.pin(key, value);
            }
        }
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for HotKeyCache<K, V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        let count = self.record_access(key);
        let value = self.inner.get(key).await?;
        self.pin_if_hot(key, &value, count);
        Ok(value)
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        let count = self.record_access(key);
        let value = self.inner.get_or_load(key, loader).await?;
        self.pin_if_hot(key, &value, count);
        Ok(value)
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        let hot = self.is_hot(key);
        let pinned = hot.then(|| value.clone());
        self.inner.put_with_ttl(key, value, ttl).await?;
        if let Some(value) = pinned {
            self.pin(key, &value);
        }
        Ok(())
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> AppResult<()> {
        self.counters.invalidate_all();
        self.inner.clear().await
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        self.inner.get_all(keys).await
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        let pinned: Vec<(K, V)> = entries
            .iter()
            .filter(|(k, _)| self.is_hot(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.inner.put_all(entries, ttl).await?;
        for (key, value) in &pinned {
            self.pin(key, value);
        }
        Ok(())
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        self.inner.remove_all(keys).await
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        self.inner.contains_key(key).await
    }
}
