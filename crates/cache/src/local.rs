//! 本地层
//!
//! 进程内并发 map，读取时惰性检查过期，后台清理任务定期淘汰过期条目。
//! 容量是简单上限而非 LRU：已满时拒绝新键的写入，已有键的更新始终允许

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tiercache_common::utils::now_millis;
use tiercache_config::CacheConfig;
use tiercache_errors::AppResult;
use tiercache_ports::{Cache, CacheKey, CacheValue, Cached, Loader};
use tracing::debug;

use crate::entry::CacheEntry;
use crate::metrics;

/// 可被后台清理任务扫描的缓存
pub trait ExpirySweep: Send + Sync {
    fn cache_name(&self) -> &str;

    /// 删除所有过期条目，返回删除数量
    fn purge_expired(&self) -> usize;

    fn entry_count(&self) -> usize;
}

/// 本地层
pub struct LocalCache<K: CacheKey, V: CacheValue> {
    name: String,
    entries: DashMap<K, CacheEntry<Cached<V>>>,
    maximum_size: usize,
    default_ttl: Option<Duration>,
}

impl<K: CacheKey, V: CacheValue> LocalCache<K, V> {
    pub fn new(name: impl Into<String>, maximum_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            maximum_size: maximum_size.max(1),
            default_ttl,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(name, config.max_local_size, config.local_ttl())
    }

    pub fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// 查找条目（包括空值标记），过期条目在此处删除
    pub fn lookup(&self, key: &K) -> Option<Cached<V>> {
        let now = now_millis();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired_at(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired_at(now));
        None
    }

    /// 写入条目，`ttl` 为 `None` 时使用默认 TTL。返回是否写入
    pub fn store(&self, key: K, value: Cached<V>, ttl: Option<Duration>) -> bool {
        let ttl = ttl.or(self.default_ttl);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.maximum_size {
            // 已满时先回收过期条目再判断
            if self.purge_expired() == 0 || self.entries.len() >= self.maximum_size {
                debug!(cache = %self.name, key = %key, "Local tier full, write rejected");
                return false;
            }
        }

        self.entries.insert(key, CacheEntry::new(value, ttl));
        true
    }

    /// 删除，返回是否删除了未过期的条目
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired())
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: CacheKey, V: CacheValue> ExpirySweep for LocalCache<K, V> {
    fn cache_name(&self) -> &str {
        &self.name
    }

    fn purge_expired(&self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for LocalCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        let found = self.lookup(key);
        metrics::record_request(&self.name, "local", found.is_some());
        Ok(found.and_then(Cached::into_option))
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        if let Some(cached) = self.lookup(key) {
            metrics::record_request(&self.name, "local", true);
            return Ok(cached.into_option());
        }
        metrics::record_request(&self.name, "local", false);

        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.store(key.clone(), Cached::Value(value.clone()), None);
        }
        Ok(loaded)
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        self.store(key.clone(), Cached::Value(value), ttl);
        metrics::record_write(&self.name, "local");
        Ok(())
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        Ok(self.invalidate(key))
    }

    async fn clear(&self) -> AppResult<()> {
        self.invalidate_all();
        Ok(())
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        Ok(self.lookup(key).is_some_and(|cached| !cached.is_null()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiercache_ports::loader;

    fn cache(max: usize) -> LocalCache<String, String> {
        LocalCache::new("local", max, None)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let cache = cache(10);
        let key = "k".to_string();

        cache.put(&key, "v1".to_string()).await.unwrap();
        cache.put(&key, "v2".to_string()).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some("v2".to_string()));

        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.remove(&key).await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let cache = cache(10);
        let key = "short".to_string();
        cache
            .put_with_ttl(&key, "v".to_string(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.contains_key(&key).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_overrides_default() {
        let cache: LocalCache<String, u32> =
            LocalCache::new("ttl", 10, Some(Duration::from_millis(10)));
        cache
            .put_with_ttl(&"forever".to_string(), 1, Some(Duration::ZERO))
            .await
            .unwrap();
        cache.put(&"default".to_string(), 2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"forever".to_string()).await.unwrap(), Some(1));
        assert_eq!(cache.get(&"default".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_keys_but_allows_updates() {
        let cache = cache(5);
        for i in 0..10 {
            cache.put(&format!("k{i}"), i.to_string()).await.unwrap();
        }
        assert_eq!(cache.len(), 5);

        let mut retrievable = 0;
        for i in 0..10 {
            if cache.get(&format!("k{i}")).await.unwrap().is_some() {
                retrievable += 1;
            }
        }
        assert!(retrievable <= 5);

        cache.put(&"k0".to_string(), "updated".to_string()).await.unwrap();
        assert_eq!(cache.get(&"k0".to_string()).await.unwrap(), Some("updated".to_string()));
    }

    #[tokio::test]
    async fn test_full_cache_reclaims_expired_entries() {
        let cache = cache(1);
        cache
            .put_with_ttl(&"old".to_string(), "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.put(&"new".to_string(), "v".to_string()).await.unwrap();
        assert!(cache.contains_key(&"new".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = cache(10);
        cache
            .put_with_ttl(&"a".to_string(), "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.put(&"b".to_string(), "v".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_null_marker_is_absent_but_present() {
        let cache = cache(10);
        let key = "missing".to_string();
        cache.store(key.clone(), Cached::Null, None);

        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(!cache.contains_key(&key).await.unwrap());
        assert_eq!(cache.lookup(&key), Some(Cached::Null));
    }

    #[tokio::test]
    async fn test_get_or_load_populates() {
        let cache = cache(10);
        let key = "k".to_string();
        let value = cache
            .get_or_load(&key, loader(|| async { Ok(Some("loaded".to_string())) }))
            .await
            .unwrap();
        assert_eq!(value, Some("loaded".to_string()));
        assert_eq!(cache.get(&key).await.unwrap(), Some("loaded".to_string()));
    }
}
