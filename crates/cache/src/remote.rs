//! 远程层
//!
//! 键以 `name:key` 为命名空间，值经过可插拔的 [`Serializer`] 编码。
//! 单项读写对瞬时故障做固定间隔的有限重试，批量操作走存储的管道接口

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_common::retry::{RetryConfig, with_conditional_retry};
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{
    Cache, CacheKey, CacheValue, Cached, JsonSerializer, Loader, RemoteStore, Serializer,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3);
const LOCK_SEGMENT: &str = "__lock__:";

/// 远程层
pub struct RemoteCache<K: CacheKey, V: CacheValue> {
    name: String,
    namespace: String,
    lock_namespace: String,
    store: Arc<dyn RemoteStore>,
    serializer: Arc<dyn Serializer<Cached<V>>>,
    retry: RetryConfig,
    default_ttl: Option<Duration>,
    lock_ttl: Duration,
    _key: PhantomData<fn() -> K>,
}

impl<K: CacheKey, V: CacheValue> RemoteCache<K, V> {
    /// 使用 JSON 序列化器创建
    pub fn new(name: impl Into<String>, store: Arc<dyn RemoteStore>) -> Self {
        Self::with_serializer(name, store, Arc::new(JsonSerializer::<Cached<V>>::new()))
    }

    pub fn with_serializer(
        name: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        serializer: Arc<dyn Serializer<Cached<V>>>,
    ) -> Self {
        let name = name.into();
        Self {
            namespace: format!("{}:", name),
            lock_namespace: format!("{}{}:", LOCK_SEGMENT, name),
            name,
            store,
            serializer,
            retry: RetryConfig::fixed(3, Duration::from_millis(50)),
            default_ttl: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            _key: PhantomData,
        }
    }

    /// 设置重试策略
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// 设置全局键前缀，键变为 `<prefix><name>:<key>`，锁键变为 `<prefix>__lock__:<name>:<key>`
    pub fn with_key_prefix(mut self, prefix: Option<&str>) -> Self {
        let prefix = prefix.unwrap_or_default();
        self.namespace = format!("{}{}:", prefix, self.name);
        self.lock_namespace = format!("{}{}{}:", prefix, LOCK_SEGMENT, self.name);
        self
    }

    /// 设置默认 TTL（`None` 表示永不过期）
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn serializer(&self) -> Arc<dyn Serializer<Cached<V>>> {
        self.serializer.clone()
    }

    /// 远程键
    pub fn remote_key(&self, key: &K) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// 加载锁的键，位于缓存命名空间之外，清空缓存不会删除持有中的锁
    pub fn lock_key(&self, key: &K) -> String {
        format!("{}{}", self.lock_namespace, key)
    }

    /// `None` 使用默认 TTL，零时长表示永不过期
    fn resolve_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match ttl {
            None => self.default_ttl,
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
        }
    }

    pub fn encode(&self, value: &Cached<V>) -> AppResult<Vec<u8>> {
        self.serializer.serialize(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> AppResult<Cached<V>> {
        self.serializer.deserialize(bytes)
    }

    /// 读取条目（包括空值标记）
    pub async fn lookup(&self, key: &K) -> AppResult<Option<Cached<V>>> {
        let remote_key = self.remote_key(key);
        let bytes = with_conditional_retry(
            &self.retry,
            "remote get",
            || {
                let store = self.store.clone();
                let remote_key = remote_key.clone();
                async move { store.get(&remote_key).await }
            },
            AppError::is_transient,
        )
        .await?;

        metrics::record_request(&self.name, "remote", bytes.is_some());
        bytes.map(|b| self.decode(&b)).transpose()
    }

    /// 一次往返批量读取
    pub async fn lookup_all(&self, keys: &[K]) -> AppResult<HashMap<K, Cached<V>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let remote_keys: Vec<String> = keys.iter().map(|k| self.remote_key(k)).collect();
        let mut raw = with_conditional_retry(
            &self.retry,
            "remote multi_get",
            || {
                let store = self.store.clone();
                let remote_keys = remote_keys.clone();
                async move { store.multi_get(&remote_keys).await }
            },
            AppError::is_transient,
        )
        .await?;

        let mut found = HashMap::with_capacity(raw.len());
        for (key, remote_key) in keys.iter().zip(&remote_keys) {
            if let Some(bytes) = raw.remove(remote_key) {
                found.insert(key.clone(), self.decode(&bytes)?);
            }
        }
        debug!(cache = %self.name, requested = keys.len(), found = found.len(), "Remote batch get");
        Ok(found)
    }

    /// 写入已编码的值
    pub async fn store_raw(&self, key: &K, bytes: &[u8], ttl: Option<Duration>) -> AppResult<()> {
        let remote_key = self.remote_key(key);
        let ttl = self.resolve_ttl(ttl);
        let bytes = bytes.to_vec();
        with_conditional_retry(
            &self.retry,
            "remote set",
            || {
                let store = self.store.clone();
                let remote_key = remote_key.clone();
                let bytes = bytes.clone();
                async move { store.set(&remote_key, &bytes, ttl).await }
            },
            AppError::is_transient,
        )
        .await
    }

    /// 编码并写入，返回编码后的字节（用于同步事件）
    pub async fn store_value(
        &self,
        key: &K,
        value: &Cached<V>,
        ttl: Option<Duration>,
    ) -> AppResult<Vec<u8>> {
        let bytes = self.encode(value)?;
        self.store_raw(key, &bytes, ttl).await?;
        Ok(bytes)
    }

    /// 一次往返批量写入，返回每个键编码后的字节
    pub async fn store_all(
        &self,
        entries: Vec<(K, Cached<V>)>,
        ttl: Option<Duration>,
    ) -> AppResult<Vec<(K, Vec<u8>)>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let bytes = self.encode(&value)?;
            encoded.push((key, bytes));
        }
        let batch: Vec<(String, Vec<u8>)> = encoded
            .iter()
            .map(|(k, b)| (self.remote_key(k), b.clone()))
            .collect();
        let ttl = self.resolve_ttl(ttl);

        with_conditional_retry(
            &self.retry,
            "remote multi_set",
            || {
                let store = self.store.clone();
                let batch = batch.clone();
                async move { store.multi_set(&batch, ttl).await }
            },
            AppError::is_transient,
        )
        .await?;
        Ok(encoded)
    }

    pub async fn invalidate(&self, key: &K) -> AppResult<bool> {
        let remote_key = self.remote_key(key);
        with_conditional_retry(
            &self.retry,
            "remote delete",
            || {
                let store = self.store.clone();
                let remote_key = remote_key.clone();
                async move { store.delete(&remote_key).await }
            },
            AppError::is_transient,
        )
        .await
    }

    /// 批量删除，返回实际删除的数量
    pub async fn invalidate_all(&self, keys: &[K]) -> AppResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let remote_keys: Vec<String> = keys.iter().map(|k| self.remote_key(k)).collect();
        self.store.multi_delete(&remote_keys).await
    }

    /// 扫描命名空间下的所有键并批量删除
    ///
    /// 非原子操作，扫描期间写入的键可能残留。代价与命名空间大小成正比，不要在热路径上调用
    pub async fn invalidate_namespace(&self) -> AppResult<u64> {
        let pattern = format!("{}*", self.namespace);
        let keys = self.store.keys_matching(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.multi_delete(&keys).await?;
        debug!(cache = %self.name, scanned = keys.len(), removed, "Remote namespace cleared");
        Ok(removed)
    }

    pub async fn exists(&self, key: &K) -> AppResult<bool> {
        self.store.exists(&self.remote_key(key)).await
    }

    /// 尝试获取 key 级别的跨实例锁，成功时返回释放用的令牌
    pub async fn try_lock(&self, key: &K) -> AppResult<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_nx(&self.lock_key(key), token.as_bytes(), self.lock_ttl)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// 释放锁，只有持有者的令牌能删除
    pub async fn unlock(&self, key: &K, token: &str) {
        if let Err(e) = self
            .store
            .delete_if_equals(&self.lock_key(key), token.as_bytes())
            .await
        {
            warn!(cache = %self.name, key = %key, error = %e, "Failed to release load lock");
        }
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for RemoteCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        Ok(self.lookup(key).await?.and_then(Cached::into_option))
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        if let Some(cached) = self.lookup(key).await? {
            return Ok(cached.into_option());
        }
        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.store_value(key, &Cached::Value(value.clone()), None)
                .await?;
        }
        Ok(loaded)
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        self.store_value(key, &Cached::Value(value), ttl).await?;
        metrics::record_write(&self.name, "sync");
        Ok(())
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        self.invalidate(key).await
    }

    async fn clear(&self) -> AppResult<()> {
        self.invalidate_namespace().await.map(|_| ())
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        Ok(self
            .lookup_all(keys)
            .await?
            .into_iter()
            .filter_map(|(k, v)| v.into_option().map(|v| (k, v)))
            .collect())
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k, Cached::Value(v)))
            .collect();
        self.store_all(entries, ttl).await.map(|_| ())
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        Ok(self.invalidate_all(keys).await? > 0)
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, RemoteCache<String, String>) {
        let store = Arc::new(MemoryStore::new());
        let cache = RemoteCache::new("orders", store.clone() as Arc<dyn RemoteStore>)
            .with_retry(RetryConfig::fixed(3, Duration::from_millis(1)));
        (store, cache)
    }

    #[tokio::test]
    async fn test_namespaced_round_trip() {
        let (store, cache) = setup();
        let key = "o1".to_string();
        cache.put(&key, "A".to_string()).await.unwrap();

        assert!(store.get("orders:o1").await.unwrap().is_some());
        assert_eq!(cache.get(&key).await.unwrap(), Some("A".to_string()));
        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let store = Arc::new(MemoryStore::new());
        let cache: RemoteCache<u64, String> =
            RemoteCache::new("users", store.clone() as Arc<dyn RemoteStore>)
                .with_key_prefix(Some("app1:"));
        assert_eq!(cache.remote_key(&42), "app1:users:42");
    }

    #[tokio::test]
    async fn test_batch_uses_single_round_trip() {
        let (store, cache) = setup();
        let entries: HashMap<String, String> = (0..5)
            .map(|i| (format!("k{i}"), format!("v{i}")))
            .collect();
        cache.put_all(entries, None).await.unwrap();

        let keys: Vec<String> = (0..7).map(|i| format!("k{i}")).collect();
        let found = cache.get_all(&keys).await.unwrap();
        assert_eq!(found.len(), 5);

        let stats = store.stats();
        assert_eq!(stats.multi_set, 1);
        assert_eq!(stats.multi_get, 1);
        assert_eq!(stats.get, 0);
    }

    #[tokio::test]
    async fn test_clear_scans_only_own_namespace() {
        let (store, cache) = setup();
        cache.put(&"a".to_string(), "1".to_string()).await.unwrap();
        cache.put(&"b".to_string(), "2".to_string()).await.unwrap();
        store.set("users:u1", b"x", None).await.unwrap();

        cache.clear().await.unwrap();
        assert!(store.keys_matching("orders:*").await.unwrap().is_empty());
        assert!(store.exists("users:u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_surface() {
        let (store, cache) = setup();
        store.set_failing(true);

        let err = cache.get(&"k".to_string()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.stats().get, 3);
    }

    #[tokio::test]
    async fn test_malformed_bytes_are_not_retried() {
        let (store, cache) = setup();
        store.set("orders:bad", b"not-json", None).await.unwrap();

        let err = cache.get(&"bad".to_string()).await.unwrap_err();
        assert!(matches!(err, AppError::Serialization(_)));
        assert_eq!(store.stats().get, 1);
    }

    #[tokio::test]
    async fn test_null_marker_round_trip() {
        let (_store, cache) = setup();
        let key = "none".to_string();
        cache.store_value(&key, &Cached::Null, None).await.unwrap();

        assert_eq!(cache.lookup(&key).await.unwrap(), Some(Cached::Null));
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(!cache.contains_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_token_checked() {
        let (_store, cache) = setup();
        let key = "o1".to_string();

        let token = cache.try_lock(&key).await.unwrap().unwrap();
        assert!(cache.try_lock(&key).await.unwrap().is_none());

        cache.unlock(&key, "someone-else").await;
        assert!(cache.try_lock(&key).await.unwrap().is_none());

        cache.unlock(&key, &token).await;
        assert!(cache.try_lock(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_keys_live_outside_cache_namespace() {
        let (store, cache) = setup();
        let key = "o1".to_string();
        assert_eq!(cache.lock_key(&key), "__lock__:orders:o1");

        let token = cache.try_lock(&key).await.unwrap().unwrap();
        // 业务键恰好以 ":lock" 结尾时不与锁冲突
        cache.put(&"o1:lock".to_string(), "v".to_string()).await.unwrap();
        assert!(cache.try_lock(&key).await.unwrap().is_none());

        cache.clear().await.unwrap();
        assert!(store.exists("__lock__:orders:o1").await.unwrap());
        assert!(cache.try_lock(&key).await.unwrap().is_none());

        cache.unlock(&key, &token).await;
        assert!(!store.exists("__lock__:orders:o1").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_key_follows_prefix() {
        let store = Arc::new(MemoryStore::new());
        let cache: RemoteCache<u64, String> =
            RemoteCache::new("users", store as Arc<dyn RemoteStore>).with_key_prefix(Some("app1:"));
        assert_eq!(cache.lock_key(&42), "app1:__lock__:users:42");
    }
}
