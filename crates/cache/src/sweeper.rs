//! 本地层过期清理任务
//!
//! 整个进程只有一个清理任务，扫描所有已注册的本地层。注册项以 `Weak` 持有，
//! 缓存被丢弃后自动移出

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::local::ExpirySweep;
use crate::metrics;

/// 过期清理任务
pub struct ExpirySweeper {
    targets: Mutex<Vec<Weak<dyn ExpirySweep>>>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
            interval,
        }
    }

    /// 注册一个本地层
    pub fn register(&self, target: Weak<dyn ExpirySweep>) {
        self.targets.lock().push(target);
    }

    /// 执行一轮清理，返回删除的条目总数
    pub fn sweep_once(&self) -> usize {
        let targets: Vec<Arc<dyn ExpirySweep>> = {
            let mut targets = self.targets.lock();
            targets.retain(|t| t.strong_count() > 0);
            targets.iter().filter_map(Weak::upgrade).collect()
        };

        let mut purged = 0;
        for target in targets {
            let removed = target.purge_expired();
            if removed > 0 {
                debug!(cache = %target.cache_name(), removed, "Expired local entries purged");
            }
            metrics::set_local_entries(target.cache_name(), target.entry_count());
            purged += removed;
        }
        purged
    }

    /// 启动后台任务，`shutdown` 取消后退出
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");
            let mut ticker = interval(self.interval);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                    _ = shutdown.cancelled() => {
                        info!("Expiry sweeper received shutdown signal");
                        break;
                    }
                }
            }
            info!("Expiry sweeper stopped");
        })
    }
}
