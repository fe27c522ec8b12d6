//! 单个缓存的配置

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiercache_ports::SyncStrategy;

use crate::ConfigError;

/// 缓存层组合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// 只有本地层
    Local,
    /// 只有远程层
    Remote,
    /// 本地层 + 远程层
    #[default]
    Both,
}

impl TierKind {
    pub fn has_local(&self) -> bool {
        matches!(self, Self::Local | Self::Both)
    }

    pub fn has_remote(&self) -> bool {
        matches!(self, Self::Remote | Self::Both)
    }
}

/// 断路器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后多久允许探测
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// 热点 key 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotKeySettings {
    pub enabled: bool,
    /// 窗口内访问次数超过该值即视为热点
    pub threshold: u64,
    /// 统计窗口
    pub time_window_ms: u64,
    /// 热点 key 在本地层的驻留时间
    pub local_expire_secs: u64,
}

impl Default for HotKeySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 100,
            time_window_ms: 1000,
            local_expire_secs: 300,
        }
    }
}

impl HotKeySettings {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }

    pub fn local_expire(&self) -> Duration {
        Duration::from_secs(self.local_expire_secs)
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tier: TierKind,
    /// 默认 TTL，0 表示永不过期
    pub ttl_secs: u64,
    /// 本地层 TTL，未设置时与 `ttl_secs` 相同
    pub local_ttl_secs: Option<u64>,
    /// 本地层最大条目数
    pub max_local_size: usize,
    /// 写入时同步写远程层；关闭时只写本地层
    pub write_through: bool,
    /// 远程写交给后台工作者
    pub async_write: bool,
    /// 缓存加载器返回的空值
    pub cache_null_values: bool,
    /// 空值标记的 TTL
    pub null_value_ttl_secs: u64,
    /// 布隆过滤器防穿透
    pub penetration_protect: bool,
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    /// 同 key 并发加载合并
    pub single_flight: bool,
    /// 等待 key 锁的最长时间
    pub lock_wait_ms: u64,
    /// 跨实例加载锁（远程层 SET NX）
    pub distributed_load_lock: bool,
    pub circuit_breaker: CircuitBreakerSettings,
    pub hot_key: HotKeySettings,
    pub sync_enabled: bool,
    pub sync_strategy: SyncStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tier: TierKind::Both,
            ttl_secs: 0,
            local_ttl_secs: None,
            max_local_size: 10_000,
            write_through: true,
            async_write: false,
            cache_null_values: false,
            null_value_ttl_secs: 60,
            penetration_protect: false,
            bloom_expected_items: 100_000,
            bloom_false_positive_rate: 0.01,
            single_flight: true,
            lock_wait_ms: 3000,
            distributed_load_lock: false,
            circuit_breaker: CircuitBreakerSettings::default(),
            hot_key: HotKeySettings::default(),
            sync_enabled: false,
            sync_strategy: SyncStrategy::Invalidate,
        }
    }
}

impl CacheConfig {
    /// 只有本地层的配置
    pub fn local(max_local_size: usize) -> Self {
        Self {
            tier: TierKind::Local,
            max_local_size,
            ..Default::default()
        }
    }

    /// 设置层组合
    pub fn with_tier(mut self, tier: TierKind) -> Self {
        self.tier = tier;
        self
    }

    /// 设置默认 TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    /// 开启同步
    pub fn with_sync(mut self, strategy: SyncStrategy) -> Self {
        self.sync_enabled = true;
        self.sync_strategy = strategy;
        self
    }

    /// 默认 TTL，`None` 表示永不过期
    pub fn ttl(&self) -> Option<Duration> {
        non_zero_secs(self.ttl_secs)
    }

    /// 本地层 TTL
    pub fn local_ttl(&self) -> Option<Duration> {
        match self.local_ttl_secs {
            Some(secs) => non_zero_secs(secs),
            None => self.ttl(),
        }
    }

    /// 空值标记 TTL，零表示永不过期
    pub fn null_value_ttl(&self) -> Duration {
        Duration::from_secs(self.null_value_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// 校验配置
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            cache: name.to_string(),
            reason: reason.to_string(),
        };

        if self.tier.has_local() && self.max_local_size == 0 {
            return Err(invalid("max_local_size must be greater than 0"));
        }
        if self.penetration_protect {
            if self.bloom_expected_items == 0 {
                return Err(invalid("bloom_expected_items must be greater than 0"));
            }
            if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
                return Err(invalid("bloom_false_positive_rate must be in (0, 1)"));
            }
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be greater than 0"));
        }
        if self.hot_key.enabled {
            if self.hot_key.time_window_ms == 0 {
                return Err(invalid("hot_key.time_window_ms must be greater than 0"));
            }
            if !self.tier.has_local() {
                return Err(invalid("hot_key requires a local tier"));
            }
        }
        Ok(())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}
