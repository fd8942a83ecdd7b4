//! 优雅关闭
//!
//! 收到 SIGINT / SIGTERM 后取消关闭令牌；主流程等待令牌后按注册顺序执行清理任务，
//! 每个任务有独立的超时，单个任务失败不影响后续任务。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::storage::SqliteStore;
use crate::worker::Worker;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只有第一次的原因会被记录
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received SIGINT, shutting down gracefully...");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down gracefully...");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.tasks.len());
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {:#}", name, e),
                Err(_) => tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout),
            }
        }
        tracing::info!("All cleanup tasks finished");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 停止 Worker：连接进入 Stopped、Watcher 退出、审计落盘
pub struct WorkerCleanup {
    worker: Arc<Worker>,
}

impl WorkerCleanup {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl ShutdownCleanup for WorkerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.worker.stop().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Worker"
    }
}

/// 关闭 SQLite 连接池
pub struct SqliteCleanup {
    store: Arc<SqliteStore>,
}

impl SqliteCleanup {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ShutdownCleanup for SqliteCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_shutdown_cancels_token_once() {
        let manager = ShutdownManager::new();
        let mut reasons = manager.subscribe();
        let token = manager.token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Interrupt);

        assert!(token.is_cancelled());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::Terminate);
        assert!(reasons.try_recv().is_err());
    }

    struct CountingCleanup {
        order: Arc<AtomicUsize>,
        seen: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ShutdownCleanup for CountingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            let n = self.order.fetch_add(1, Ordering::SeqCst);
            self.seen.store(n + 1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks_in_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(1));
        coordinator.register(CountingCleanup {
            order: order.clone(),
            seen: first.clone(),
            fail: true,
        });
        coordinator.register(CountingCleanup {
            order: order.clone(),
            seen: second.clone(),
            fail: false,
        });
        coordinator.run_cleanup().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }
}
