//! 断路器
//!
//! Closed -> Open：连续瞬时故障达到阈值。
//! Open -> Closed：下一次调用时发现距打开已超过 `reset_timeout`，计数和打开标记一起重置，
//! 放行这次调用作为探测（没有单独的半开状态）。
//!
//! 打开期间装饰器不访问内层：读返回空，写、删除、清空为空操作

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tiercache_common::utils::now_millis;
use tiercache_config::CircuitBreakerSettings;
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{Cache, CacheKey, CacheValue, Loader};
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: settings.reset_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    failure_count: u32,
    is_open: bool,
    opened_at_millis: i64,
}

/// 断路器
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// 执行受保护的操作，打开时返回 `AppError::CircuitOpen`
    pub async fn call<F, Fut, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.check_state()?;
        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_transient() => self.record_failure(),
            // 加载器和序列化错误与依赖的健康无关
            Err(_) => {}
        }
        result
    }

    fn check_state(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.is_open {
            return Ok(());
        }

        let elapsed = now_millis().saturating_sub(state.opened_at_millis);
        if elapsed >= self.config.reset_timeout.as_millis() as i64 {
            state.is_open = false;
            state.failure_count = 0;
            info!(cache = %self.name, "Circuit breaker reset, probing");
            metrics::record_circuit_transition(&self.name, "closed");
            return Ok(());
        }
        Err(AppError::circuit_open(self.name.clone()))
    }

    fn record_success(&self) {
        self.state.lock().failure_count = 0;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        if !state.is_open && state.failure_count >= self.config.failure_threshold {
            state.is_open = true;
            state.opened_at_millis = now_millis();
            warn!(
                cache = %self.name,
                failures = state.failure_count,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker transitioned to OPEN"
            );
            metrics::record_circuit_transition(&self.name, "open");
        }
    }
}

/// 断路器装饰器
pub struct CircuitBreakerCache<K: CacheKey, V: CacheValue> {
    inner: Arc<dyn Cache<K, V>>,
    breaker: CircuitBreaker,
}

impl<K: CacheKey, V: CacheValue> CircuitBreakerCache<K, V> {
    pub fn new(inner: Arc<dyn Cache<K, V>>, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(inner.name(), config);
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// 把打开状态转换为降级结果
fn degrade<T>(result: AppResult<T>, fallback: T) -> AppResult<T> {
    match result {
        Err(AppError::CircuitOpen(_)) => Ok(fallback),
        other => other,
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for CircuitBreakerCache<K, V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        degrade(self.breaker.call(|| self.inner.get(key)).await, None)
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        degrade(
            self.breaker
                .call(|| self.inner.get_or_load(key, loader))
                .await,
            None,
        )
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        degrade(
            self.breaker
                .call(|| self.inner.put_with_ttl(key, value, ttl))
                .await,
            (),
        )
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        degrade(self.breaker.call(|| self.inner.remove(key)).await, false)
    }

    async fn clear(&self) -> AppResult<()> {
        degrade(self.breaker.call(|| self.inner.clear()).await, ())
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        degrade(
            self.breaker.call(|| self.inner.get_all(keys)).await,
            HashMap::new(),
        )
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        degrade(
            self.breaker
                .call(|| self.inner.put_all(entries, ttl))
                .await,
            (),
        )
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        degrade(self.breaker.call(|| self.inner.remove_all(keys)).await, false)
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        degrade(
            self.breaker.call(|| self.inner.contains_key(key)).await,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 可控失败的内层缓存，记录调用次数
    #[derive(Default)]
    struct FlakyCache {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyCache {
        fn outcome(&self) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(AppError::remote("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Cache<String, String> for FlakyCache {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, _key: &String) -> AppResult<Option<String>> {
            self.outcome().map(|_| Some("v".to_string()))
        }

        async fn get_or_load(&self, _key: &String, loader: Loader<String>) -> AppResult<Option<String>> {
            self.outcome()?;
            loader().await
        }

        async fn put_with_ttl(&self, _key: &String, _value: String, _ttl: Option<Duration>) -> AppResult<()> {
            self.outcome()
        }

        async fn remove(&self, _key: &String) -> AppResult<bool> {
            self.outcome().map(|_| true)
        }

        async fn clear(&self) -> AppResult<()> {
            self.outcome()
        }
    }

    fn setup(threshold: u32, reset: Duration) -> (Arc<FlakyCache>, CircuitBreakerCache<String, String>) {
        let inner = Arc::new(FlakyCache::default());
        let cache = CircuitBreakerCache::new(
            inner.clone() as Arc<dyn Cache<String, String>>,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: reset,
            },
        );
        (inner, cache)
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let (inner, cache) = setup(3, Duration::from_secs(60));
        inner.failing.store(true, Ordering::SeqCst);
        let key = "k".to_string();

        for _ in 0..3 {
            assert!(cache.get(&key).await.is_err());
        }
        assert!(cache.breaker().is_open());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        // 打开后不再访问内层
        assert_eq!(cache.get(&key).await.unwrap(), None);
        cache.put(&key, "v".to_string()).await.unwrap();
        assert!(!cache.remove(&key).await.unwrap());
        cache.clear().await.unwrap();
        assert!(!cache.contains_key(&key).await.unwrap());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resets_after_timeout() {
        let (inner, cache) = setup(2, Duration::from_millis(50));
        inner.failing.store(true, Ordering::SeqCst);
        let key = "k".to_string();

        assert!(cache.get(&key).await.is_err());
        assert!(cache.get(&key).await.is_err());
        assert!(cache.breaker().is_open());

        inner.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.get(&key).await.unwrap(), Some("v".to_string()));
        assert!(!cache.breaker().is_open());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (inner, cache) = setup(3, Duration::from_secs(60));
        let key = "k".to_string();

        inner.failing.store(true, Ordering::SeqCst);
        assert!(cache.get(&key).await.is_err());
        assert!(cache.get(&key).await.is_err());
        inner.failing.store(false, Ordering::SeqCst);
        cache.get(&key).await.unwrap();

        assert_eq!(cache.breaker().failure_count(), 0);
        assert!(!cache.breaker().is_open());
    }

    #[tokio::test]
    async fn test_loader_errors_do_not_trip() {
        let (_inner, cache) = setup(1, Duration::from_secs(60));
        let err = cache
            .get_or_load(
                &"k".to_string(),
                tiercache_ports::loader(|| async { Err(AppError::loader("not found")) }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Loader(_)));
        assert!(!cache.breaker().is_open());
    }
}
