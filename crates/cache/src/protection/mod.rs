//! 保护装饰器
//!
//! 每个装饰器都实现 [`tiercache_ports::Cache`]，包装内层缓存后可以任意叠加

mod bloom;
mod circuit_breaker;
mod hot_key;
mod single_flight;

pub use bloom::{BloomFilterCache, BloomSyncListener, SimpleBloomFilter};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerCache, CircuitBreakerConfig};
pub use hot_key::HotKeyCache;
pub use single_flight::SingleFlightCache;
