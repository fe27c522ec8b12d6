//! 调用点缓存辅助函数
//!
//! 调用方把自己的函数调用包在这些函数里，得到"先查缓存、未命中再计算"的语义；
//! 键由调用方直接给出，或通过 [`KeyGenerator`] 从 [`InvocationContext`] 生成

use std::future::Future;

use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{Cache, CacheKey, CacheValue, InvocationContext, KeyGenerator, loader};
use tracing::debug;

/// 先查缓存，未命中时执行 `f` 并把结果写回
pub async fn with_cache<K, V, F, Fut>(cache: &dyn Cache<K, V>, key: &K, f: F) -> AppResult<Option<V>>
where
    K: CacheKey,
    V: CacheValue,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<Option<V>>> + Send + 'static,
{
    cache.get_or_load(key, loader(f)).await
}

/// 与 [`with_cache`] 相同，键由生成器从调用上下文得出
pub async fn with_cache_keyed<K, V, F, Fut>(
    cache: &dyn Cache<K, V>,
    generator: &dyn KeyGenerator,
    context: &InvocationContext,
    f: F,
) -> AppResult<Option<V>>
where
    K: CacheKey,
    V: CacheValue,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<Option<V>>> + Send + 'static,
{
    let key = generate_key::<K>(generator, context)?;
    with_cache(cache, &key, f).await
}

/// 总是执行 `f`，成功后把结果写入缓存
pub async fn cache_put<K, V, F, Fut>(cache: &dyn Cache<K, V>, key: &K, f: F) -> AppResult<V>
where
    K: CacheKey,
    V: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<V>>,
{
    let value = f().await?;
    cache.put(key, value.clone()).await?;
    debug!(cache = %cache.name(), key = %key, "Result cached after invocation");
    Ok(value)
}

/// 失效的时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictTiming {
    /// `f` 成功后失效，`f` 失败时缓存保持不变
    #[default]
    AfterInvocation,
    /// 先失效再执行 `f`，无论 `f` 是否成功
    BeforeInvocation,
}

/// 执行 `f` 并失效 `key`
pub async fn cache_evict<K, V, T, F, Fut>(
    cache: &dyn Cache<K, V>,
    key: &K,
    timing: EvictTiming,
    f: F,
) -> AppResult<T>
where
    K: CacheKey,
    V: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    if timing == EvictTiming::BeforeInvocation {
        cache.remove(key).await?;
        return f().await;
    }

    let result = f().await?;
    cache.remove(key).await?;
    debug!(cache = %cache.name(), key = %key, "Key evicted after invocation");
    Ok(result)
}

/// 执行 `f` 成功后清空整个缓存
pub async fn cache_evict_all<K, V, T, F, Fut>(cache: &dyn Cache<K, V>, f: F) -> AppResult<T>
where
    K: CacheKey,
    V: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let result = f().await?;
    cache.clear().await?;
    Ok(result)
}

/// 用生成器生成键并解析为 `K`
pub fn generate_key<K: CacheKey>(
    generator: &dyn KeyGenerator,
    context: &InvocationContext,
) -> AppResult<K> {
    let raw = generator.generate(context);
    raw.parse::<K>().map_err(|_| {
        AppError::configuration(format!(
            "Generated key '{}' for {}.{} cannot be parsed",
            raw, context.target, context.method
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCache;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiercache_ports::{FnKeyGenerator, SimpleKeyGenerator};

    fn cache() -> LocalCache<String, String> {
        LocalCache::new("interceptor", 100, None)
    }

    #[tokio::test]
    async fn test_with_cache_computes_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "user:1".to_string();

        for _ in 0..3 {
            let calls = calls.clone();
            let value = with_cache(&cache, &key, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some("alice".to_string()))
            })
            .await
            .unwrap();
            assert_eq!(value, Some("alice".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_cache_keyed_uses_generator() {
        let cache = cache();
        let ctx = InvocationContext::new("UserService", "find").arg("t1").arg(42);

        with_cache_keyed(&cache, &SimpleKeyGenerator, &ctx, || async {
            Ok(Some("bob".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(
            cache.get(&"t1:42".to_string()).await.unwrap(),
            Some("bob".to_string())
        );

        let custom = FnKeyGenerator::new(|ctx: &InvocationContext| {
            format!("{}#{}", ctx.method, ctx.args.join(","))
        });
        with_cache_keyed(&cache, &custom, &ctx, || async { Ok(Some("carol".to_string())) })
            .await
            .unwrap();
        assert!(cache.contains_key(&"find#t1,42".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_generated_key_parse_failure() {
        let ctx = InvocationContext::new("Svc", "count").arg("not-a-number");
        let err = generate_key::<u64>(&SimpleKeyGenerator, &ctx).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_cache_put_always_invokes() {
        let cache = cache();
        let key = "k".to_string();
        cache.put(&key, "stale".to_string()).await.unwrap();

        let value = cache_put(&cache, &key, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
        assert_eq!(cache.get(&key).await.unwrap(), Some("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_cache_evict_timing() {
        let cache = cache();
        let key = "k".to_string();

        cache.put(&key, "v".to_string()).await.unwrap();
        let err = cache_evict(&cache, &key, EvictTiming::AfterInvocation, || async {
            Err::<(), _>(AppError::loader("update failed"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Loader(_)));
        assert!(cache.contains_key(&key).await.unwrap());

        let _ = cache_evict(&cache, &key, EvictTiming::BeforeInvocation, || async {
            Err::<(), _>(AppError::loader("update failed"))
        })
        .await;
        assert!(!cache.contains_key(&key).await.unwrap());

        cache.put(&key, "v".to_string()).await.unwrap();
        cache_evict(&cache, &key, EvictTiming::default(), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_evict_all_clears() {
        let cache = cache();
        cache.put(&"a".to_string(), "1".to_string()).await.unwrap();
        cache.put(&"b".to_string(), "2".to_string()).await.unwrap();

        let n = cache_evict_all(&cache, || async { Ok(2) }).await.unwrap();
        assert_eq!(n, 2);
        assert!(cache.is_empty());
    }
}
