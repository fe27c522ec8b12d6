//! 布隆过滤器防穿透
//!
//! 过滤器记录所有写入过的键。判断"一定不存在"的键直接返回空，不访问内层缓存，
//! 也不调用加载器；判断"可能存在"时照常查询。没有假阴性。
//!
//! 对于不经过本缓存写入的合法键，用 [`SimpleBloomFilter::add`] 预热

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tiercache_errors::AppResult;
use tiercache_ports::{
    Cache, CacheEvent, CacheEventListener, CacheEventType, CacheKey, CacheValue, Loader,
    SyncStrategy,
};
use tracing::debug;

use crate::metrics;

/// 进程内布隆过滤器
pub struct SimpleBloomFilter {
    bits: Vec<AtomicU64>,
    /// bitmap 大小（位）
    size: u64,
    /// hash 函数数量
    num_hashes: u32,
}

impl SimpleBloomFilter {
    /// 根据预期元素数量和误判率计算最优参数
    pub fn new(expected_items: u64, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let size = Self::optimal_size(expected_items, false_positive_rate).max(64);
        let num_hashes = Self::optimal_num_hashes(size, expected_items);
        let words = size.div_ceil(64) as usize;

        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            size,
            num_hashes,
        }
    }

    /// m = -n * ln(p) / (ln(2)^2)
    fn optimal_size(n: u64, p: f64) -> u64 {
        let m = -(n as f64) * p.ln() / (2.0_f64.ln().powi(2));
        m.ceil() as u64
    }

    /// k = (m / n) * ln(2)
    fn optimal_num_hashes(m: u64, n: u64) -> u32 {
        let k = (m as f64 / n as f64) * 2.0_f64.ln();
        k.ceil().max(1.0) as u32
    }

    fn hash(&self, item: &str, seed: u32) -> u64 {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        seed.hash(&mut hasher);
        hasher.finish() % self.size
    }

    pub fn add(&self, item: &str) {
        for seed in 0..self.num_hashes {
            let bit = self.hash(item, seed);
            self.bits[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    pub fn might_contain(&self, item: &str) -> bool {
        (0..self.num_hashes).all(|seed| {
            let bit = self.hash(item, seed);
            self.bits[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// 布隆过滤器防穿透装饰器
pub struct BloomFilterCache<K: CacheKey, V: CacheValue> {
    inner: Arc<dyn Cache<K, V>>,
    filter: Arc<SimpleBloomFilter>,
}

impl<K: CacheKey, V: CacheValue> BloomFilterCache<K, V> {
    pub fn new(inner: Arc<dyn Cache<K, V>>, filter: Arc<SimpleBloomFilter>) -> Self {
        Self { inner, filter }
    }

    pub fn filter(&self) -> &Arc<SimpleBloomFilter> {
        &self.filter
    }

    fn admits(&self, key: &K) -> bool {
        if self.filter.might_contain(&key.to_string()) {
            return true;
        }
        debug!(cache = %self.inner.name(), key = %key, "Key rejected by bloom filter");
        metrics::record_penetration_blocked(self.inner.name());
        false
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for BloomFilterCache<K, V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        if !self.admits(key) {
            return Ok(None);
        }
        self.inner.get(key).await
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        if !self.admits(key) {
            return Ok(None);
        }
        self.inner.get_or_load(key, loader).await
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        self.filter.add(&key.to_string());
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> AppResult<()> {
        self.inner.clear().await
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        let admitted: Vec<K> = keys.iter().filter(|k| self.admits(k)).cloned().collect();
        if admitted.is_empty() {
            return Ok(HashMap::new());
        }
        self.inner.get_all(&admitted).await
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        for key in entries.keys() {
            self.filter.add(&key.to_string());
        }
        self.inner.put_all(entries, ttl).await
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        self.inner.remove_all(keys).await
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        if !self.admits(key) {
            return Ok(false);
        }
        self.inner.contains_key(key).await
    }
}

/// 把其他实例写入的键加入本地过滤器
pub struct BloomSyncListener {
    filter: Weak<SimpleBloomFilter>,
}

impl BloomSyncListener {
    pub fn new(filter: &Arc<SimpleBloomFilter>) -> Self {
        Self {
            filter: Arc::downgrade(filter),
        }
    }
}

#[async_trait]
impl CacheEventListener for BloomSyncListener {
    async fn on_event(&self, event: &CacheEvent, _strategy: SyncStrategy) -> AppResult<()> {
        if event.event_type != CacheEventType::Put {
            return Ok(());
        }
        if let (Some(filter), Some(key)) = (self.filter.upgrade(), event.key.as_deref()) {
            filter.add(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCache;
    use std::sync::atomic::AtomicUsize;
    use tiercache_ports::loader;

    #[test]
    fn test_optimal_size_calculation() {
        let size = SimpleBloomFilter::optimal_size(1000, 0.01);
        assert!(size > 9000 && size < 10000); // 约 9585
    }

    #[test]
    fn test_optimal_num_hashes_calculation() {
        assert_eq!(SimpleBloomFilter::optimal_num_hashes(9585, 1000), 7);
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = SimpleBloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            filter.add(&format!("key-{i}"));
        }
        for i in 0..1000 {
            assert!(filter.might_contain(&format!("key-{i}")));
        }

        let false_positives = (0..1000)
            .filter(|i| filter.might_contain(&format!("absent-{i}")))
            .count();
        // 理论误判率 1%，留出足够余量
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    fn guarded() -> (Arc<LocalCache<String, String>>, BloomFilterCache<String, String>) {
        let inner = Arc::new(LocalCache::new("guarded", 100, None));
        let cache = BloomFilterCache::new(
            inner.clone() as Arc<dyn Cache<String, String>>,
            Arc::new(SimpleBloomFilter::new(100, 0.01)),
        );
        (inner, cache)
    }

    #[tokio::test]
    async fn test_unknown_key_short_circuits() {
        let (inner, cache) = guarded();
        // 绕过过滤器直接写入内层
        inner.put(&"hidden".to_string(), "v".to_string()).await.unwrap();

        assert_eq!(cache.get(&"hidden".to_string()).await.unwrap(), None);
        assert!(!cache.contains_key(&"hidden".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_written_keys_pass_through() {
        let (_inner, cache) = guarded();
        cache.put(&"k".to_string(), "v".to_string()).await.unwrap();
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some("v".to_string()));

        let mut entries = HashMap::new();
        entries.insert("a".to_string(), "1".to_string());
        cache.put_all(entries, None).await.unwrap();
        let found = cache
            .get_all(&["a".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_loader_not_invoked_for_unknown_key() {
        let (_inner, cache) = guarded();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let value = cache
            .get_or_load(
                &"ghost".to_string(),
                loader(move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("v".to_string()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // 预热后可以加载
        cache.filter().add("ghost");
        let c = calls.clone();
        let value = cache
            .get_or_load(
                &"ghost".to_string(),
                loader(move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("v".to_string()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(value, Some("v".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_listener_adds_remote_keys() {
        let filter = Arc::new(SimpleBloomFilter::new(100, 0.01));
        let listener = BloomSyncListener::new(&filter);

        let event = CacheEvent::put("orders", "o7", b"{}".to_vec(), "other");
        listener.on_event(&event, SyncStrategy::Invalidate).await.unwrap();
        assert!(filter.might_contain("o7"));
    }
}
