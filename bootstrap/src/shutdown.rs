//! Graceful Shutdown

use std::future::Future;

use tiercache_errors::AppResult;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown 控制器
///
/// 触发后所有已经在等待和之后开始等待的调用者都会立即返回
#[derive(Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        info!("Triggering shutdown");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待关闭
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 供后台任务使用的取消令牌
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// 运行任务直到完成或收到关闭
pub async fn run_with_shutdown<Fut>(shutdown: &ShutdownController, task: Fut) -> AppResult<()>
where
    Fut: Future<Output = AppResult<()>>,
{
    tokio::select! {
        result = task => result,
        _ = shutdown.wait() => {
            info!("Task cancelled due to shutdown");
            Ok(())
        }
    }
}
