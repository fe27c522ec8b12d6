//! tiercache-config - 配置加载库
//!
//! 从 `<dir>/default.toml`、`<dir>/<APP_ENV>.toml` 和 `TIERCACHE_` 前缀的环境变量加载

mod cache;

pub use cache::*;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid config for cache '{cache}': {reason}")]
    Invalid { cache: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// 远程存储后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// Redis
    #[default]
    Redis,
    /// 进程内存储（单节点部署）
    Memory,
    /// 不配置远程存储，只能创建本地缓存
    None,
}

/// 远程层重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRetrySettings {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl Default for RemoteRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl RemoteRetrySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// 远程存储配置
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub backend: RemoteBackend,
    #[serde(default = "default_redis_url")]
    pub url: Secret<String>,
    /// 所有远程键和频道的全局前缀
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub retry: RemoteRetrySettings,
    /// 跨实例加载锁的持有时间
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

fn default_redis_url() -> Secret<String> {
    Secret::new("redis://127.0.0.1:6379".to_string())
}

fn default_lock_ttl_ms() -> u64 {
    3000
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::default(),
            url: default_redis_url(),
            key_prefix: None,
            retry: RemoteRetrySettings::default(),
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl RemoteSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// 本地层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSettings {
    /// 过期清理间隔
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl LocalSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// 频道前缀，频道名为 `<prefix><cacheName>`
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_publish_workers")]
    pub publish_workers: usize,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
}

fn default_channel_prefix() -> String {
    "tiercache:sync:".to_string()
}

fn default_publish_workers() -> usize {
    1
}

fn default_dispatch_workers() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            publish_workers: default_publish_workers(),
            dispatch_workers: default_dispatch_workers(),
        }
    }
}

/// 后台工作池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// 异步远程写工作者数量
    #[serde(default = "default_async_write_workers")]
    pub async_write: usize,
    /// 关闭时等待排空的最长时间
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_async_write_workers() -> usize {
    2
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            async_write: default_async_write_workers(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// 遥测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

/// 缓存引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub local: LocalSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    /// 未单独配置的缓存使用的配置
    #[serde(default)]
    pub defaults: CacheConfig,
    /// 按名称配置的缓存
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
}

fn default_app_name() -> String {
    "tiercache".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_env: default_app_env(),
            telemetry: TelemetrySettings::default(),
            remote: RemoteSettings::default(),
            local: LocalSettings::default(),
            sync: SyncSettings::default(),
            workers: WorkerSettings::default(),
            defaults: CacheConfig::default(),
            caches: HashMap::new(),
        }
    }
}

impl CacheSettings {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(format!("{}/default.toml", config_dir)))
                .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
                .merge(Env::prefixed("TIERCACHE_").split("__")),
        )
    }

    /// 从 TOML 字符串加载（测试和嵌入式配置）
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// 校验所有缓存配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate("<defaults>")?;
        for (name, config) in &self.caches {
            config.validate(name)?;
        }
        Ok(())
    }

    /// 获取指定名称缓存的配置，未配置时使用默认配置
    pub fn cache_config(&self, name: &str) -> CacheConfig {
        self.caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}
