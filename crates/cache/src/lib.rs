//! tiercache - 多级缓存引擎
//!
//! - 本地层：并发 map，惰性过期 + 后台清理，容量上限时拒绝新键
//! - 远程层：命名空间键、可插拔序列化、批量流水线、固定退避重试
//! - 多级编排：本地 -> 远程 -> 加载器，回填与 write-through / write-around
//! - 同步引擎：远程写入后发布事件，其他实例按 Invalidate / Update 策略更新本地层
//! - 保护装饰器：布隆过滤器、singleflight、断路器、热点 key
//! - [`CacheManager`]：按名称创建缓存并持有共享的后台资源

mod entry;
mod interceptor;
mod local;
mod manager;
mod memory;
mod metrics;
mod multi_level;
mod remote;
mod stats;
mod sweeper;
mod sync;
mod worker;

pub mod protection;

pub use entry::CacheEntry;
pub use interceptor::{
    EvictTiming, cache_evict, cache_evict_all, cache_put, generate_key, with_cache,
    with_cache_keyed,
};
pub use local::{ExpirySweep, LocalCache};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use memory::{MemoryStore, MemoryStoreStats, glob_match};
pub use multi_level::{LocalTierSyncListener, MultiLevelCache};
pub use remote::RemoteCache;
pub use stats::CacheStatsSnapshot;
pub use sweeper::ExpirySweeper;
pub use sync::{ALL_CACHES, SyncConfig, SyncManager};
pub use worker::WorkerPool;
