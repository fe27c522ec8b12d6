//! Cache trait 定义

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tiercache_errors::AppResult;

/// 缓存键
///
/// 远程层以 `name:key` 作为命名空间键，同步事件以字符串传输键，
/// 因此键必须能与字符串互相转换
pub trait CacheKey: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Display + FromStr + Send + Sync + 'static {}

/// 缓存值
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// 层中存储的值：真实值或空值标记
///
/// 开启空值缓存时，"加载结果为空" 以 `Null` 存储，与 "没有条目" 区分开
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cached<V> {
    Value(V),
    Null,
}

impl<V> Cached<V> {
    pub fn from_option(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Null,
        }
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            Self::Value(v) => Some(v),
            Self::Null => None,
        }
    }

    pub fn as_option(&self) -> Option<&V> {
        match self {
            Self::Value(v) => Some(v),
            Self::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// 未命中时调用的加载器
pub type Loader<V> = Box<dyn FnOnce() -> BoxFuture<'static, AppResult<Option<V>>> + Send>;

/// 把异步闭包包装为 [`Loader`]
pub fn loader<V, F, Fut>(f: F) -> Loader<V>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<Option<V>>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// 缓存 trait
///
/// 批量操作默认逐个调用单项操作，各层可以覆盖以获得更高效率
#[async_trait]
pub trait Cache<K: CacheKey, V: CacheValue>: Send + Sync {
    /// 缓存名称（远程命名空间和同步路由键）
    fn name(&self) -> &str;

    /// 获取缓存值
    async fn get(&self, key: &K) -> AppResult<Option<V>>;

    /// 获取缓存值，未命中时调用加载器并回填
    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>>;

    /// 使用默认 TTL 写入
    async fn put(&self, key: &K, value: V) -> AppResult<()> {
        self.put_with_ttl(key, value, None).await
    }

    /// 写入，`None` 使用缓存默认 TTL，零时长表示永不过期
    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()>;

    /// 删除，返回是否有条目被删除
    async fn remove(&self, key: &K) -> AppResult<bool>;

    /// 清空
    async fn clear(&self) -> AppResult<()>;

    /// 批量获取，只返回命中的键
    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// 批量写入
    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        for (key, value) in entries {
            self.put_with_ttl(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// 批量删除，任意一个被删除即返回 true
    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        let mut removed = false;
        for key in keys {
            removed |= self.remove(key).await?;
        }
        Ok(removed)
    }

    /// 检查是否存在
    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_option_conversion() {
        assert_eq!(Cached::from_option(Some(3)).into_option(), Some(3));
        assert!(Cached::<u32>::from_option(None).is_null());
        assert_eq!(Cached::Value("a").as_option(), Some(&"a"));
    }

    #[test]
    fn test_cached_wire_shape() {
        let json = serde_json::to_string(&Cached::Value(7)).unwrap();
        assert_eq!(json, r#"{"kind":"value","value":7}"#);
        let null = serde_json::to_string(&Cached::<u32>::Null).unwrap();
        assert_eq!(null, r#"{"kind":"null"}"#);
    }

    #[tokio::test]
    async fn test_loader_helper() {
        let load = loader(|| async { Ok(Some(5u32)) });
        assert_eq!(load().await.unwrap(), Some(5));
    }
}
