//! 多级缓存
//!
//! 本地层 + 远程层的组合：
//! - 读：本地命中直接返回；本地未命中查远程，远程命中回填本地（不发布同步事件）；
//!   两层都未命中时调用加载器，结果写入两层
//! - 写：先写本地，再按策略同步或异步写远程（write-through），或只写本地（write-around）
//! - 删除/清空：无条件扇出到所有层，结果取或
//!
//! 读路径上的远程层错误不做屏蔽，直接返回给调用方（或外层断路器）

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tiercache_config::{CacheConfig, TierKind};
use tiercache_errors::AppResult;
use tiercache_ports::{
    Cache, CacheEvent, CacheEventListener, CacheEventType, CacheKey, CacheValue, Cached, Loader,
    Serializer, SyncStrategy,
};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::local::LocalCache;
use crate::metrics;
use crate::remote::RemoteCache;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::sync::SyncManager;
use crate::worker::WorkerPool;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 多级缓存
pub struct MultiLevelCache<K: CacheKey, V: CacheValue> {
    name: String,
    config: CacheConfig,
    local: Option<Arc<LocalCache<K, V>>>,
    remote: Option<Arc<RemoteCache<K, V>>>,
    sync: Option<Arc<SyncManager>>,
    writer: Option<Arc<WorkerPool>>,
    stats: CacheStats,
}

impl<K: CacheKey, V: CacheValue> MultiLevelCache<K, V> {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
            local: None,
            remote: None,
            sync: None,
            writer: None,
            stats: CacheStats::default(),
        }
    }

    pub fn with_local(mut self, local: Arc<LocalCache<K, V>>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_remote(mut self, remote: Arc<RemoteCache<K, V>>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// 远程写成功后通过同步引擎发布事件
    pub fn with_sync(mut self, sync: Arc<SyncManager>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// 异步远程写使用的工作池
    pub fn with_async_writer(mut self, writer: Arc<WorkerPool>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn local(&self) -> Option<&Arc<LocalCache<K, V>>> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<RemoteCache<K, V>>> {
        self.remote.as_ref()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// 把本地层接到同步引擎上的监听器，没有本地层或远程层时为 `None`
    pub fn sync_listener(&self) -> Option<Arc<dyn CacheEventListener>> {
        let local = self.local.as_ref()?;
        let remote = self.remote.as_ref()?;
        Some(Arc::new(LocalTierSyncListener {
            local: Arc::downgrade(local),
            serializer: remote.serializer(),
            null_ttl: self.config.null_value_ttl(),
        }))
    }

    /// 本地层写入时使用的 TTL，配置了更短的本地 TTL 时取较短者
    fn local_ttl_for(&self, ttl: Option<Duration>) -> Option<Duration> {
        let Some(ttl) = ttl else { return None };
        match self.config.local_ttl_secs {
            Some(secs) if secs > 0 => {
                let local = Duration::from_secs(secs);
                if ttl.is_zero() || local < ttl {
                    Some(local)
                } else {
                    Some(ttl)
                }
            }
            _ => Some(ttl),
        }
    }

    fn backfill_ttl(&self, value: &Cached<V>) -> Option<Duration> {
        if value.is_null() {
            Some(self.config.null_value_ttl())
        } else {
            None
        }
    }

    /// 是否需要写远程层
    fn writes_remote(&self) -> bool {
        match self.config.tier {
            TierKind::Remote => true,
            TierKind::Both => self.config.write_through,
            TierKind::Local => false,
        }
    }

    fn backfill(&self, key: &K, value: &Cached<V>) {
        if let Some(local) = &self.local {
            local.store(key.clone(), value.clone(), self.backfill_ttl(value));
        }
    }

    fn publish_put(&self, key: &K, bytes: Vec<u8>) {
        if let Some(sync) = &self.sync {
            sync.publish_put(&self.name, key.to_string(), bytes);
        }
    }

    /// 依次查找各层，返回条目（包括空值标记）
    async fn lookup(&self, key: &K) -> AppResult<Option<Cached<V>>> {
        if let Some(local) = &self.local {
            let found = local.lookup(key);
            self.stats.local(found.is_some());
            metrics::record_request(&self.name, "local", found.is_some());
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(remote) = &self.remote {
            let found = remote.lookup(key).await?;
            self.stats.remote(found.is_some());
            if let Some(value) = &found {
                debug!(cache = %self.name, key = %key, "Remote hit, backfilling local tier");
                self.backfill(key, value);
                return Ok(found);
            }
        }

        self.stats.miss();
        Ok(None)
    }

    /// 按写策略写入各层
    async fn write(&self, key: &K, value: Cached<V>, ttl: Option<Duration>) -> AppResult<()> {
        self.stats.write();
        if let Some(local) = &self.local {
            local.store(key.clone(), value.clone(), self.local_ttl_for(ttl));
        }

        let Some(remote) = self.remote.as_ref().filter(|_| self.writes_remote()) else {
            metrics::record_write(&self.name, "local");
            return Ok(());
        };

        if self.config.async_write {
            if let Some(writer) = &self.writer {
                let remote = remote.clone();
                let sync = self.sync.clone();
                let name = self.name.clone();
                let job_key = key.clone();
                let shard = (self.name.as_str(), key.to_string());
                let submitted = writer.submit_keyed(&shard, async move {
                    match remote.store_value(&job_key, &value, ttl).await {
                        Ok(bytes) => {
                            if let Some(sync) = sync {
                                sync.publish_put(&name, job_key.to_string(), bytes);
                            }
                        }
                        Err(e) => {
                            error!(cache = %name, key = %job_key, error = %e, "Async remote write failed");
                        }
                    }
                });
                if submitted {
                    metrics::record_write(&self.name, "async");
                } else {
                    warn!(cache = %self.name, key = %key, "Async remote write dropped");
                }
                return Ok(());
            }
        }

        let bytes = remote.store_value(key, &value, ttl).await?;
        metrics::record_write(&self.name, "sync");
        self.publish_put(key, bytes);
        Ok(())
    }

    /// 把加载结果写入各层，空结果在开启空值缓存时写入空值标记
    async fn fill(&self, key: &K, loaded: &Option<V>) -> AppResult<()> {
        match loaded {
            Some(value) => self.write(key, Cached::Value(value.clone()), None).await,
            None if self.config.cache_null_values => {
                self.write(key, Cached::Null, Some(self.config.null_value_ttl()))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn load_and_fill(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        self.stats.load();
        let loaded = loader().await?;
        debug!(cache = %self.name, key = %key, found = loaded.is_some(), "Loader invoked");
        self.fill(key, &loaded).await?;
        Ok(loaded)
    }

    /// 持有跨实例锁加载；抢锁失败的实例轮询远程层，等待超时后自行加载
    async fn load_with_lock(
        &self,
        key: &K,
        loader: Loader<V>,
        remote: &RemoteCache<K, V>,
    ) -> AppResult<Option<V>> {
        if let Some(token) = remote.try_lock(key).await? {
            let result = match remote.lookup(key).await {
                Ok(Some(value)) => {
                    self.backfill(key, &value);
                    Ok(value.into_option())
                }
                Ok(None) => self.load_and_fill(key, loader).await,
                Err(e) => Err(e),
            };
            remote.unlock(key, &token).await;
            return result;
        }

        let deadline = Instant::now() + self.config.lock_wait();
        while Instant::now() < deadline {
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            if let Some(value) = remote.lookup(key).await? {
                self.backfill(key, &value);
                return Ok(value.into_option());
            }
        }

        debug!(cache = %self.name, key = %key, "Load lock wait expired, loading locally");
        self.load_and_fill(key, loader).await
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> Cache<K, V> for MultiLevelCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> AppResult<Option<V>> {
        Ok(self.lookup(key).await?.and_then(Cached::into_option))
    }

    async fn get_or_load(&self, key: &K, loader: Loader<V>) -> AppResult<Option<V>> {
        if let Some(found) = self.lookup(key).await? {
            return Ok(found.into_option());
        }

        match &self.remote {
            Some(remote) if self.config.distributed_load_lock => {
                self.load_with_lock(key, loader, remote).await
            }
            _ => self.load_and_fill(key, loader).await,
        }
    }

    async fn put_with_ttl(&self, key: &K, value: V, ttl: Option<Duration>) -> AppResult<()> {
        self.write(key, Cached::Value(value), ttl).await
    }

    async fn remove(&self, key: &K) -> AppResult<bool> {
        self.stats.removal();
        let mut removed = false;
        if let Some(local) = &self.local {
            removed |= local.invalidate(key);
        }
        if let Some(remote) = &self.remote {
            removed |= remote.invalidate(key).await?;
            if let Some(sync) = &self.sync {
                sync.publish_remove(&self.name, key.to_string());
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> AppResult<()> {
        if let Some(local) = &self.local {
            local.invalidate_all();
        }
        if let Some(remote) = &self.remote {
            remote.invalidate_namespace().await?;
            if let Some(sync) = &self.sync {
                sync.publish_clear(&self.name);
            }
        }
        debug!(cache = %self.name, "Cache cleared");
        Ok(())
    }

    async fn get_all(&self, keys: &[K]) -> AppResult<HashMap<K, V>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            match self.local.as_ref().and_then(|local| local.lookup(key)) {
                Some(cached) => {
                    self.stats.local(true);
                    if let Some(value) = cached.into_option() {
                        found.insert(key.clone(), value);
                    }
                }
                None => missing.push(key.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(found);
        }

        if let Some(remote) = &self.remote {
            let fetched = remote.lookup_all(&missing).await?;
            for (key, cached) in fetched {
                self.stats.remote(true);
                self.backfill(&key, &cached);
                if let Some(value) = cached.into_option() {
                    found.insert(key, value);
                }
            }
        }
        Ok(found)
    }

    async fn put_all(&self, entries: HashMap<K, V>, ttl: Option<Duration>) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(local) = &self.local {
            let local_ttl = self.local_ttl_for(ttl);
            for (key, value) in &entries {
                local.store(key.clone(), Cached::Value(value.clone()), local_ttl);
            }
        }

        let Some(remote) = self.remote.as_ref().filter(|_| self.writes_remote()) else {
            return Ok(());
        };
        let batch: Vec<(K, Cached<V>)> = entries
            .into_iter()
            .map(|(k, v)| (k, Cached::Value(v)))
            .collect();

        if self.config.async_write {
            if let Some(writer) = &self.writer {
                // 按键所在的工作者拆批，与单键异步写共用同一队列
                let mut shards: HashMap<usize, Vec<(K, Cached<V>)>> = HashMap::new();
                for (key, value) in batch {
                    let shard = writer.shard_of(&(self.name.as_str(), key.to_string()));
                    shards.entry(shard).or_default().push((key, value));
                }
                for (shard, part) in shards {
                    let remote = remote.clone();
                    let sync = self.sync.clone();
                    let name = self.name.clone();
                    let size = part.len();
                    let submitted = writer.submit_to(shard, async move {
                        match remote.store_all(part, ttl).await {
                            Ok(encoded) => {
                                if let Some(sync) = sync {
                                    for (key, bytes) in encoded {
                                        sync.publish_put(&name, key.to_string(), bytes);
                                    }
                                }
                            }
                            Err(e) => error!(cache = %name, error = %e, "Async remote batch write failed"),
                        }
                    });
                    if !submitted {
                        warn!(cache = %self.name, size, "Async remote batch write dropped");
                    }
                }
                return Ok(());
            }
        }

        for (key, bytes) in remote.store_all(batch, ttl).await? {
            self.publish_put(&key, bytes);
        }
        Ok(())
    }

    async fn remove_all(&self, keys: &[K]) -> AppResult<bool> {
        let mut removed = false;
        if let Some(local) = &self.local {
            for key in keys {
                removed |= local.invalidate(key);
            }
        }
        if let Some(remote) = &self.remote {
            removed |= remote.invalidate_all(keys).await? > 0;
            if let Some(sync) = &self.sync {
                for key in keys {
                    sync.publish_remove(&self.name, key.to_string());
                }
            }
        }
        Ok(removed)
    }

    async fn contains_key(&self, key: &K) -> AppResult<bool> {
        if let Some(local) = &self.local {
            if let Some(cached) = local.lookup(key) {
                return Ok(!cached.is_null());
            }
        }
        match &self.remote {
            // 没有空值标记时用 EXISTS，省去传输和解码
            Some(remote) if !self.config.cache_null_values => remote.exists(key).await,
            Some(remote) => Ok(remote
                .lookup(key)
                .await?
                .is_some_and(|cached| !cached.is_null())),
            None => Ok(false),
        }
    }
}

/// 把同步事件应用到本地层
pub struct LocalTierSyncListener<K: CacheKey, V: CacheValue> {
    local: Weak<LocalCache<K, V>>,
    serializer: Arc<dyn Serializer<Cached<V>>>,
    null_ttl: Duration,
}

impl<K: CacheKey, V: CacheValue> LocalTierSyncListener<K, V> {
    fn parse_key(event: &CacheEvent) -> Option<K> {
        let raw = event.key.as_deref()?;
        match raw.parse::<K>() {
            Ok(key) => Some(key),
            Err(_) => {
                warn!(cache = %event.cache_name, key = %raw, "Cannot parse key from cache event");
                None
            }
        }
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> CacheEventListener for LocalTierSyncListener<K, V> {
    async fn on_event(&self, event: &CacheEvent, strategy: SyncStrategy) -> AppResult<()> {
        let Some(local) = self.local.upgrade() else {
            return Ok(());
        };

        match event.event_type {
            CacheEventType::Clear => local.invalidate_all(),
            CacheEventType::Remove => {
                if let Some(key) = Self::parse_key(event) {
                    local.invalidate(&key);
                }
            }
            CacheEventType::Put => {
                let Some(key) = Self::parse_key(event) else {
                    return Ok(());
                };
                match (strategy, &event.value) {
                    (SyncStrategy::Update, Some(bytes)) => {
                        let value = self.serializer.deserialize(bytes)?;
                        let ttl = value.is_null().then_some(self.null_ttl);
                        local.store(key, value, ttl);
                    }
                    _ => {
                        local.invalidate(&key);
                    }
                }
            }
        }
        debug!(
            cache = %event.cache_name,
            event_type = event.event_type.as_str(),
            ?strategy,
            "Cache event applied to local tier"
        );
        Ok(())
    }
}
