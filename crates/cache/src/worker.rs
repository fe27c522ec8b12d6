//! 后台工作池
//!
//! 固定数量的 tokio 任务，每个工作者有自己的无界队列。带分片键提交的任务按键哈希
//! 固定到同一个工作者，同一个键的任务严格按提交顺序执行。异步远程写、事件发布和
//! 事件分发各用一个池，由 [`crate::CacheManager`] 持有并在关闭时一起排空

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Job = BoxFuture<'static, ()>;

/// 后台工作池
pub struct WorkerPool {
    name: String,
    size: usize,
    senders: Mutex<Option<Vec<mpsc::UnboundedSender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// 创建并启动工作者，必须在 tokio 运行时内调用
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let pool = name.clone();
            senders.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(pool = %pool, worker = index, "Background job panicked");
                    }
                }
                debug!(pool = %pool, worker = index, "Worker stopped");
            }));
        }

        debug!(pool = %name, size, "Worker pool started");

        Self {
            name,
            size,
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 分片键对应的工作者下标
    pub fn shard_of<H: Hash + ?Sized>(&self, shard: &H) -> usize {
        let mut hasher = DefaultHasher::new();
        shard.hash(&mut hasher);
        (hasher.finish() % self.size as u64) as usize
    }

    /// 提交无顺序要求的任务，轮流分给各工作者。池已关闭时返回 false
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.size;
        self.dispatch(index, Box::pin(job))
    }

    /// 提交任务到分片键对应的工作者，同一个分片键的任务按提交顺序执行
    pub fn submit_keyed<H, F>(&self, shard: &H, job: F) -> bool
    where
        H: Hash + ?Sized,
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.dispatch(self.shard_of(shard), Box::pin(job))
    }

    /// 提交到指定下标的工作者，下标来自 [`WorkerPool::shard_of`]
    pub fn submit_to<F>(&self, index: usize, job: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.dispatch(index % self.size, Box::pin(job))
    }

    fn dispatch(&self, index: usize, job: Job) -> bool {
        let senders = self.senders.lock();
        match senders.as_ref().and_then(|s| s.get(index)) {
            Some(tx) => tx.send(job).is_ok(),
            None => {
                warn!(pool = %self.name, "Job rejected, worker pool is shut down");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.senders.lock().is_some()
    }

    /// 关闭：停止接收新任务，在 `timeout` 内排空队列，超时后中止剩余工作者
    pub async fn shutdown(&self, timeout: Duration) {
        if self.senders.lock().take().is_none() {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(timeout, join_all(workers)).await.is_err() {
            warn!(
                pool = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker pool did not drain in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!(pool = %self.name, "Worker pool drained");
        }
    }
}
