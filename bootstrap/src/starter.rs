//! 进程启动器
//!
//! 加载配置、初始化日志和指标、组装缓存基础设施，然后运行调用方的任务直到收到关闭信号

use std::future::Future;
use std::sync::Arc;

use tiercache_config::CacheSettings;
use tiercache_errors::{AppError, AppResult};
use tiercache_telemetry::MetricsRecorder;
use tracing::{info, warn};

use crate::infrastructure::CacheInfrastructure;
use crate::runtime::{init_runtime, shutdown_signal};
use crate::shutdown::{ShutdownController, run_with_shutdown};

/// 启动缓存进程
///
/// `app` 拿到组装好的基础设施；进程收到 Ctrl+C / SIGTERM 时 `app` 被取消，
/// 随后管理器按顺序关闭
pub async fn run<F, Fut>(config_dir: &str, app: F) -> AppResult<()>
where
    F: FnOnce(Arc<CacheInfrastructure>) -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let settings = CacheSettings::load(config_dir)
        .map_err(|e| AppError::configuration(e.to_string()))?;
    init_runtime(&settings);

    // 指标导出器全局只能安装一次
    let _metrics = match MetricsRecorder::install() {
        Ok(recorder) => Some(recorder),
        Err(e) => {
            warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    let infra = Arc::new(CacheInfrastructure::from_settings(settings).await?);

    let shutdown = ShutdownController::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.shutdown();
    });

    info!(app_name = %infra.settings.app_name, "Cache process running");
    let result = run_with_shutdown(&shutdown, app(infra.clone())).await;

    infra.shutdown().await;
    result
}
