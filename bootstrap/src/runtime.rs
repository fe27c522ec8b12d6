//! 进程运行时

use tiercache_config::CacheSettings;
use tiercache_telemetry::{init_tracing, init_tracing_json};
use tracing::{error, info};

/// 初始化运行时：生产环境或显式配置时输出 JSON 日志
pub fn init_runtime(settings: &CacheSettings) {
    if settings.telemetry.json || settings.is_production() {
        init_tracing_json(&settings.telemetry.log_level);
    } else {
        init_tracing(&settings.telemetry.log_level);
    }

    info!(
        app_name = %settings.app_name,
        app_env = %settings.app_env,
        "Runtime initialized"
    );
}

/// 等待 Ctrl+C 或 SIGTERM
///
/// 无法安装某个信号处理器时只记录错误，继续等待其他信号
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
