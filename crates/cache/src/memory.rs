//! 进程内远程存储
//!
//! 完整实现 [`RemoteStore`]：TTL、glob 键匹配、发布订阅、SET NX。
//! 用于单节点部署，也作为测试替身提供按操作计数和故障注入

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_common::utils::{expire_at_millis, now_millis};
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::{MessageHandler, RemoteStore, Subscription};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

struct StoredValue {
    data: Vec<u8>,
    expire_at_millis: i64,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expire_at_millis: expire_at_millis(ttl),
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expire_at_millis == 0 || now <= self.expire_at_millis
    }
}

#[derive(Default)]
struct OperationCounters {
    get: AtomicU64,
    set: AtomicU64,
    delete: AtomicU64,
    exists: AtomicU64,
    multi_get: AtomicU64,
    multi_set: AtomicU64,
    multi_delete: AtomicU64,
    scan: AtomicU64,
    publish: AtomicU64,
}

/// 各操作的调用次数快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub get: u64,
    pub set: u64,
    pub delete: u64,
    pub exists: u64,
    pub multi_get: u64,
    pub multi_set: u64,
    pub multi_delete: u64,
    pub scan: u64,
    pub publish: u64,
}

impl MemoryStoreStats {
    /// 读操作总数
    pub fn reads(&self) -> u64 {
        self.get + self.exists + self.multi_get
    }

    /// 写操作总数
    pub fn writes(&self) -> u64 {
        self.set + self.multi_set
    }
}

/// 进程内远程存储
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    channel: broadcast::Sender<(String, Vec<u8>)>,
    failing: AtomicBool,
    counters: OperationCounters,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            channel,
            failing: AtomicBool::new(false),
            counters: OperationCounters::default(),
        }
    }

    /// 故障注入：开启后所有操作返回 `AppError::Remote`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let c = &self.counters;
        MemoryStoreStats {
            get: c.get.load(Ordering::Relaxed),
            set: c.set.load(Ordering::Relaxed),
            delete: c.delete.load(Ordering::Relaxed),
            exists: c.exists.load(Ordering::Relaxed),
            multi_get: c.multi_get.load(Ordering::Relaxed),
            multi_set: c.multi_set.load(Ordering::Relaxed),
            multi_delete: c.multi_delete.load(Ordering::Relaxed),
            scan: c.scan.load(Ordering::Relaxed),
            publish: c.publish.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.get,
            &c.set,
            &c.delete,
            &c.exists,
            &c.multi_get,
            &c.multi_set,
            &c.multi_delete,
            &c.scan,
            &c.publish,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// 未过期的键数量
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, counter: &AtomicU64) -> AppResult<()> {
        counter.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::remote("connection refused (injected)"));
        }
        Ok(())
    }

    fn read(&self, key: &str, now: i64) -> Option<Vec<u8>> {
        {
            let entry = self.entries.get(key)?;
            if entry.is_live(now) {
                return Some(entry.data.clone());
            }
        }
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        None
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        self.check(&self.counters.get)?;
        Ok(self.read(key, now_millis()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> AppResult<()> {
        self.check(&self.counters.set)?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        self.check(&self.counters.delete)?;
        let now = now_millis();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now)))
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        self.check(&self.counters.exists)?;
        Ok(self.read(key, now_millis()).is_some())
    }

    async fn multi_get(&self, keys: &[String]) -> AppResult<HashMap<String, Vec<u8>>> {
        self.check(&self.counters.multi_get)?;
        let now = now_millis();
        Ok(keys
            .iter()
            .filter_map(|key| self.read(key, now).map(|data| (key.clone(), data)))
            .collect())
    }

    async fn multi_set(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> AppResult<()> {
        self.check(&self.counters.multi_set)?;
        for (key, value) in entries {
            self.entries
                .insert(key.clone(), StoredValue::new(value.clone(), ttl));
        }
        Ok(())
    }

    async fn multi_delete(&self, keys: &[String]) -> AppResult<u64> {
        self.check(&self.counters.multi_delete)?;
        let now = now_millis();
        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(*key).is_some_and(|(_, v)| v.is_live(now)))
            .count() as u64)
    }

    async fn keys_matching(&self, pattern: &str) -> AppResult<Vec<String>> {
        self.check(&self.counters.scan)?;
        let now = now_millis();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> AppResult<bool> {
        self.check(&self.counters.set)?;
        let now = now_millis();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value.to_vec(), Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value.to_vec(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> AppResult<bool> {
        self.check(&self.counters.delete)?;
        let now = now_millis();
        Ok(self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.data == expected)
            .is_some())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> AppResult<()> {
        self.check(&self.counters.publish)?;
        // 没有订阅者时 send 返回错误，与 Redis PUBLISH 返回 0 等价
        let _ = self.channel.send((channel.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> AppResult<Subscription> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::remote("connection refused (injected)"));
        }

        let mut rx = self.channel.subscribe();
        let filter = pattern.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) => {
                        if glob_match(&filter, &channel) {
                            handler(channel, payload);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(pattern = %filter, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(pattern, handle))
    }

    async fn ping(&self) -> AppResult<Duration> {
        let started = Instant::now();
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::remote("connection refused (injected)"));
        }
        Ok(started.elapsed())
    }
}

/// Redis 风格的 glob 匹配，支持 `*`、`?` 和 `\` 转义
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == t[ti] => {
                    pi += 2;
                    ti += 1;
                    continue;
                }
                c if c != '\\' && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("orders:*", "orders:o1"));
        assert!(glob_match("orders:*", "orders:"));
        assert!(!glob_match("orders:*", "users:u1"));
        assert!(glob_match("tiercache:sync:*", "tiercache:sync:orders"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*:lock", "orders:o1:lock"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_set_get_delete_with_ttl() {
        let store = MemoryStore::new();
        store.set("k", b"v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let store = MemoryStore::new();
        let entries = vec![
            ("a:1".to_string(), b"1".to_vec()),
            ("a:2".to_string(), b"2".to_vec()),
            ("b:1".to_string(), b"3".to_vec()),
        ];
        store.multi_set(&entries, None).await.unwrap();

        let found = store
            .multi_get(&["a:1".to_string(), "a:3".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let mut keys = store.keys_matching("a:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a:1".to_string(), "a:2".to_string()]);

        assert_eq!(store.multi_delete(&keys).await.unwrap(), 2);
        assert_eq!(store.len(), 1);

        let stats = store.stats();
        assert_eq!(stats.multi_set, 1);
        assert_eq!(stats.multi_get, 1);
        assert_eq!(stats.scan, 1);
    }

    #[tokio::test]
    async fn test_set_nx_and_delete_if_equals() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", b"t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock", b"t2", Duration::from_secs(5)).await.unwrap());

        assert!(!store.delete_if_equals("lock", b"t2").await.unwrap());
        assert!(store.delete_if_equals("lock", b"t1").await.unwrap());
        assert!(store.set_nx("lock", b"t2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let store = MemoryStore::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |channel: String, payload: Vec<u8>| {
            let _ = tx.send((channel, payload));
        });
        let subscription = store.subscribe("sync:*", handler).await.unwrap();
        assert!(subscription.is_active());

        store.publish("other:x", b"ignored").await.unwrap();
        store.publish("sync:orders", b"hello").await.unwrap();

        let (channel, payload) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel, "sync:orders");
        assert_eq!(payload, b"hello".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.ping().await.is_err());

        store.set_failing(false);
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().get, 2);
    }
}
