//! 独立缓存节点
//!
//! 创建配置里列出的所有缓存（字符串键值），定期输出健康状态，直到收到关闭信号

use std::sync::Arc;
use std::time::Duration;

use tiercache_bootstrap::{CacheInfrastructure, run};
use tiercache_common::HealthStatus;
use tiercache_errors::AppResult;
use tracing::{info, warn};

async fn serve(infra: Arc<CacheInfrastructure>) -> AppResult<()> {
    let names: Vec<String> = infra.settings.caches.keys().cloned().collect();
    for name in &names {
        infra.manager().get_or_create::<String, String>(name)?;
    }
    info!(caches = ?names, "Caches registered");

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let health = infra.health().await;
        match health.status() {
            HealthStatus::Healthy => {
                info!(components = health.total_count(), "Cache node healthy");
            }
            status => warn!(
                ?status,
                failed = ?health.failed_components(),
                "Cache node degraded"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let config_dir = std::env::var("TIERCACHE_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    run(&config_dir, serve).await
}
