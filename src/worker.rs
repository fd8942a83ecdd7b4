//! Worker：把存储、审计、凭据缓存、连接管理器与标志轮询器组装起来
//!
//! 启动顺序：确保会话行存在（失败即致命）→ 审计写入任务 → 连接管理器 → 标志轮询器 → start()。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::audit::AuditSink;
use crate::config::AppConfig;
use crate::connection::{ConnectionDeps, ConnectionManager, ConnectionOptions, ConnectionSnapshot};
use crate::core::WorkerError;
use crate::engine::ProtocolEngine;
use crate::flags::FlagWatcher;
use crate::session::CredentialCache;
use crate::storage::Storage;

pub struct Worker {
    connection: ConnectionManager,
    audit: AuditSink,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub async fn start(
        config: &AppConfig,
        store: Arc<dyn Storage>,
        engine: Arc<dyn ProtocolEngine>,
    ) -> Result<Self, WorkerError> {
        config.validate().map_err(WorkerError::InvalidConfig)?;

        tracing::info!("Ensuring session record...");
        let record = store
            .ensure_session()
            .await
            .map_err(WorkerError::SessionUnavailable)?;
        tracing::info!(
            session_id = %record.id,
            status = record.status.as_str(),
            has_credentials = !record.credentials.is_empty(),
            "Session record ready"
        );

        let (audit, _writer) = AuditSink::spawn(store.clone());
        let credentials = Arc::new(CredentialCache::new(store.clone()));
        let connection = ConnectionManager::spawn(ConnectionDeps {
            engine,
            store: store.clone(),
            credentials,
            audit: audit.clone(),
            options: ConnectionOptions::from_config(config),
        });

        let watcher = FlagWatcher::new(
            store,
            Arc::new(connection.clone()),
            audit.clone(),
            Duration::from_millis(config.flags.poll_ms),
            config.flags.stale_requests,
        );
        let watcher = tokio::spawn(watcher.run(connection.shutdown_token()));

        let worker = Self {
            connection,
            audit,
            watcher: Mutex::new(Some(watcher)),
        };
        if let Err(e) = worker.connection.start().await {
            tracing::error!("Failed to start connection: {}", e);
            worker.stop().await;
            return Err(e.into());
        }

        tracing::info!("WA Monitor worker started");
        Ok(worker)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    /// 停止连接（取消重连与轮询），等待轮询器退出并刷出审计
    pub async fn stop(&self) {
        self.connection.stop().await;
        if let Some(watcher) = self.watcher.lock().await.take() {
            if let Err(e) = watcher.await {
                tracing::warn!("Flag watcher task failed: {}", e);
            }
        }
        self.audit.flush().await;
        tracing::info!("WA Monitor worker stopped");
    }
}
