//! 审计日志
//!
//! 所有生命周期事件与指令处理结果都经由 AuditSink 追加写入。Sink 内部是一个单独的写入任务：
//! 调用方只把条目放进通道（不等待 I/O），写入任务按入队顺序逐条落库，写失败只记日志。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::storage::Storage;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    QrGenerated,
    Connect,
    Disconnect,
    /// 已安排一次重连
    Reconnect,
    Discovery,
    /// 运行时指令处理成功
    FlagHandled,
    Error,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::QrGenerated => "qr_generated",
            AuditKind::Connect => "connect",
            AuditKind::Disconnect => "disconnect",
            AuditKind::Reconnect => "reconnect",
            AuditKind::Discovery => "discovery",
            AuditKind::FlagHandled => "flag_handled",
            AuditKind::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            AuditKind::QrGenerated,
            AuditKind::Connect,
            AuditKind::Disconnect,
            AuditKind::Reconnect,
            AuditKind::Discovery,
            AuditKind::FlagHandled,
            AuditKind::Error,
        ]
        .into_iter()
        .find(|k| k.as_str() == name)
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条审计记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, detail: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            detail,
        }
    }
}

enum AuditMessage {
    Entry(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// 审计写入端（可克隆）
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditMessage>,
}

impl AuditSink {
    /// 启动写入任务；所有 Sink 克隆被丢弃后任务结束
    pub fn spawn(store: Arc<dyn Storage>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    /// 追加一条记录（不等待落库）
    pub fn record(&self, kind: AuditKind, detail: serde_json::Value) {
        if self
            .tx
            .send(AuditMessage::Entry(AuditEntry::new(kind, detail)))
            .is_err()
        {
            tracing::warn!("Audit writer stopped, dropping {} entry", kind);
        }
    }

    /// 等待此前入队的记录全部处理完
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSink").finish_non_exhaustive()
    }
}

async fn run_writer(store: Arc<dyn Storage>, mut rx: mpsc::UnboundedReceiver<AuditMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            AuditMessage::Entry(entry) => {
                if let Err(e) = store.append_audit(&entry).await {
                    tracing::error!("Failed to log audit event {}: {}", entry.kind, e);
                }
            }
            AuditMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Audit writer finished");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_entries_written_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (sink, _writer) = AuditSink::spawn(store.clone());

        sink.record(AuditKind::QrGenerated, json!({}));
        sink.record(AuditKind::Connect, json!({"number": "1555"}));
        sink.record(AuditKind::Disconnect, json!({"cause": "transient"}));
        sink.flush().await;

        assert_eq!(
            store.audit_kinds().await,
            vec![AuditKind::QrGenerated, AuditKind::Connect, AuditKind::Disconnect]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let (sink, _writer) = AuditSink::spawn(store.clone());

        store.fail_audit(true);
        sink.record(AuditKind::Error, json!({"code": "X"}));
        sink.flush().await;
        store.fail_audit(false);
        sink.record(AuditKind::Connect, json!({}));
        sink.flush().await;

        assert_eq!(store.audit_kinds().await, vec![AuditKind::Connect]);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(AuditKind::QrGenerated.as_str(), "qr_generated");
        assert_eq!(AuditKind::from_name("flag_handled"), Some(AuditKind::FlagHandled));
        assert_eq!(AuditKind::from_name("nope"), None);
    }
}
