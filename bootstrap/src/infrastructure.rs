//! 基础设施组装
//!
//! 按配置选择远程存储后端，并在其上构建缓存管理器

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tiercache::{CacheManager, MemoryStore};
use tiercache_adapter_redis::{RedisStore, RedisStoreConfig};
use tiercache_common::{AggregatedHealthResult, RetryConfig, with_retry};
use tiercache_config::{CacheSettings, RemoteBackend};
use tiercache_errors::{AppError, AppResult};
use tiercache_ports::RemoteStore;
use tracing::info;

/// 按配置创建远程存储
///
/// Redis 连接在启动阶段带退避重试，其余后端不会失败
pub async fn create_store(settings: &CacheSettings) -> AppResult<Option<Arc<dyn RemoteStore>>> {
    match settings.remote.backend {
        RemoteBackend::Redis => {
            let config = RedisStoreConfig::new(settings.remote.url.expose_secret().as_str());
            let retry = RetryConfig::new(5, Duration::from_millis(500), Duration::from_secs(5));

            let store = with_retry(&retry, "Redis connection", || {
                let config = config.clone();
                async move { RedisStore::connect(config).await }
            })
            .await?;
            Ok(Some(Arc::new(store)))
        }
        RemoteBackend::Memory => {
            info!("Using in-process remote store");
            Ok(Some(Arc::new(MemoryStore::new())))
        }
        RemoteBackend::None => {
            info!("No remote store configured, only local caches are available");
            Ok(None)
        }
    }
}

/// 缓存基础设施：远程存储 + 缓存管理器
pub struct CacheInfrastructure {
    pub settings: CacheSettings,
    manager: CacheManager,
}

impl CacheInfrastructure {
    pub async fn from_settings(settings: CacheSettings) -> AppResult<Self> {
        settings
            .validate()
            .map_err(|e| AppError::configuration(e.to_string()))?;

        let store = create_store(&settings).await?;
        let mut builder = CacheManager::builder(settings.clone());
        if let Some(store) = store {
            builder = builder.remote_store(store);
        }
        let manager = builder.build().await?;

        info!(
            backend = ?settings.remote.backend,
            caches = settings.caches.len(),
            "Cache infrastructure initialized"
        );

        Ok(Self { settings, manager })
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.manager.remote_store()
    }

    pub async fn health(&self) -> AggregatedHealthResult {
        self.manager.health().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        info!("Cache infrastructure shut down");
    }
}
