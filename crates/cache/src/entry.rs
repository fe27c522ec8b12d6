//! 缓存条目

use std::time::Duration;

use tiercache_common::utils::{expire_at_millis, now_millis};

/// 本地层中的条目，`expire_at_millis == 0` 表示永不过期
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expire_at_millis: i64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expire_at_millis: expire_at_millis(ttl),
        }
    }

    /// 在给定时间点是否已过期
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expire_at_millis > 0 && now_millis > self.expire_at_millis
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}
