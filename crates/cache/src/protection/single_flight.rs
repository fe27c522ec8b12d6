//! 缓存击穿防护
//!
//! 同一个 key 的并发未命中只调用一次加载器：每个 key 按需创建一把互斥锁，
//! 持锁者加载并把结果留在锁内，其余调用者拿到锁后直接读取结果。
//! 等锁超过 `lock_wait` 的调用者返回空，而不是再去调用加载器

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tiercache_errors::AppResult;
use tiercache_ports::{Cache, CacheKey, CacheValue, Loader};
use tokio::sync::Mutex;
use tracing::debug;

/// 一次加载的结果槽，`None` 表示还没有成功的结果
type Flight<V> = Arc<Mutex<Option<Option<V>>>>;

/// Singleflight 装饰器
pub struct SingleFlightCache<K: CacheKey, V: CacheValue> {
    inner: Arc<dyn Cache<K, V>>,
    flights: DashMap<K, Flight<V>>,
    lock_wait: Duration,
}

impl<K: CacheKey, V: CacheValue> SingleFlightCache<K, V> {
    pub fn new(inner: Arc<dyn Cache<K, V>>, lock_wait: Duration) -> Self {
        Self {
            inner,
            flights: DashMap::new(),
            lock_wait,
        }
    }

    /// 进行中的加载数量
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for SingleFlightCache<K, V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        self.inner.get(key).await
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        if let Some(value) = self.inner.get(key).await? {
            return Ok(Some(value));
        }

        let flight = self.flights.entry(key.clone()).or_default().clone();

        let Ok(mut slot) = tokio::time::timeout(self.lock_wait, flight.lock()).await else {
            debug!(
                cache = %self.inner.name(),
                key = %key,
                wait_ms = self.lock_wait.as_millis() as u64,
                "Timed out waiting for in-flight load"
            );
            return Ok(None);
        };

        if let Some(result) = slot.as_ref() {
            return Ok(result.clone());
        }

        let result = self.inner.get_or_load(key, loader).await;
        if let Ok(value) = &result {
            *slot = Some(value.clone());
        }
        // 结果已放入槽中，后续调用者重新走缓存
        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, &flight));
        drop(slot);
        result
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> AppResult<()> {
        self.inner.clear().await
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        self.inner.get_all(keys).await
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        self.inner.put_all(entries, ttl).await
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        self.inner.remove_all(keys).await
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        self.inner.contains_key(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiercache_errors::AppError;
    use tiercache_ports::loader;

    fn guarded(lock_wait: Duration) -> Arc<SingleFlightCache<String, String>> {
        let inner: Arc<dyn Cache<String, String>> = Arc::new(LocalCache::new("sf", 100, None));
        Arc::new(SingleFlightCache::new(inner, lock_wait))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_load_once() {
        let cache = guarded(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(
                        &"hot".to_string(),
                        loader(move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(Some("value".to_string()))
                        }),
                    )
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value, Some("value".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_times_out_with_absent() {
        let cache = guarded(Duration::from_millis(50));

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(
                        &"slow".to_string(),
                        loader(|| async {
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok(Some("late".to_string()))
                        }),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let waited = cache
            .get_or_load(
                &"slow".to_string(),
                loader(move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("dup".to_string()))
                }),
            )
            .await
            .unwrap();

        assert_eq!(waited, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(leader.await.unwrap().unwrap(), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_failed_load_lets_next_caller_retry() {
        let cache = guarded(Duration::from_secs(1));
        let key = "flaky".to_string();

        let err = cache
            .get_or_load(&key, loader(|| async { Err(AppError::loader("db down")) }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Loader(_)));

        let value = cache
            .get_or_load(&key, loader(|| async { Ok(Some("ok".to_string())) }))
            .await
            .unwrap();
        assert_eq!(value, Some("ok".to_string()));
    }
}
