//! WA Monitor Worker 主程序（本地联调）
//!
//! 使用 SQLite 存储与脚本化引擎运行完整的 Worker，从 stdin 逐行读取引擎事件：
//!
//! ```text
//! qr ABC123                      # 发出二维码
//! open 15551234567@s.whatsapp.net Ops
//! creds {"creds":{"me":"1555"}}
//! close                          # 瞬时断开；close 401 表示已登出
//! group 120363@g.us Ops Room     # 供群组发现返回
//! ```
//!
//! 启动：cargo run -- [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use wa_monitor::config::load_config;
use wa_monitor::core::shutdown::{SqliteCleanup, WorkerCleanup};
use wa_monitor::core::{ShutdownCoordinator, ShutdownManager};
use wa_monitor::engine::ScriptedEngine;
use wa_monitor::storage::SqliteStore;
use wa_monitor::{observability, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    observability::init(&config.log.level);

    tracing::info!("Starting WA Monitor Worker...");
    let store = Arc::new(
        SqliteStore::connect(&config.storage)
            .await
            .context("Failed to open database")?,
    );
    let engine = Arc::new(ScriptedEngine::new());
    let worker = Arc::new(
        Worker::start(&config, store.clone(), engine.clone())
            .await
            .context("Failed to start worker")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    #[cfg(feature = "http")]
    {
        let connection = worker.connection().clone();
        let bind = config.http.bind.clone();
        let manager = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = wa_monitor::http::serve(&bind, connection, manager.token()).await {
                tracing::error!("HTTP server failed: {:#}", e);
                manager.shutdown(wa_monitor::core::ShutdownReason::FatalError(e.to_string()));
            }
        });
    }

    let script = tokio::spawn(drive_from_stdin(engine));

    shutdown.wait_for_shutdown().await;
    script.abort();

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(WorkerCleanup::new(worker));
    coordinator.register(SqliteCleanup::new(store));
    coordinator.run_cleanup().await;

    Ok(())
}

/// 把 stdin 的每一行交给脚本化引擎；输入结束后 Worker 继续运行
async fn drive_from_stdin(engine: Arc<ScriptedEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if let Err(e) = engine.apply_script_line(&line) {
                    tracing::warn!("Script command rejected: {}", e);
                }
            }
            Ok(None) => {
                tracing::info!("Script input closed");
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read script input: {}", e);
                break;
            }
        }
    }
}
