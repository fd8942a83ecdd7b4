//! 标志轮询器
//!
//! 每个轮询周期对固定的三个标志依次执行：读取 → 判空 → 与 lastHandled 比较时间戳 →
//! 分发 → 记录 lastHandled → 清空。处理失败不清空也不前移 lastHandled，下个周期重试。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{FlagName, FlagRequest, StaleRequests};
use crate::audit::{AuditKind, AuditSink};
use crate::storage::Storage;

/// 标志处理器
#[async_trait]
pub trait FlagHandler: Send + Sync {
    async fn handle(&self, flag: FlagName, request: &FlagRequest) -> anyhow::Result<()>;
}

/// 单个标志在一次轮询中的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 无待处理请求
    Idle,
    /// 时间戳未前进，已处理过
    Skipped,
    /// 启动前遗留的请求被清空而未执行
    Discarded,
    Handled,
    /// 处理器返回错误，保留标志待下次重试
    Failed(String),
    /// 读取标志失败
    Unreadable(String),
}

/// 标志轮询器
pub struct FlagWatcher {
    store: Arc<dyn Storage>,
    handler: Arc<dyn FlagHandler>,
    audit: AuditSink,
    poll_interval: Duration,
    stale_requests: StaleRequests,
    started_at: DateTime<Utc>,
    last_handled: BTreeMap<FlagName, DateTime<Utc>>,
}

impl FlagWatcher {
    pub fn new(
        store: Arc<dyn Storage>,
        handler: Arc<dyn FlagHandler>,
        audit: AuditSink,
        poll_interval: Duration,
        stale_requests: StaleRequests,
    ) -> Self {
        Self {
            store,
            handler,
            audit,
            poll_interval,
            stale_requests,
            started_at: Utc::now(),
            last_handled: BTreeMap::new(),
        }
    }

    /// 该标志最近一次成功处理的 requestedAt
    pub fn last_handled(&self, flag: FlagName) -> Option<DateTime<Utc>> {
        self.last_handled.get(&flag).copied()
    }

    /// 按固定间隔轮询，直到 token 被取消
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            stale_requests = ?self.stale_requests,
            "Runtime flag watcher started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
        tracing::info!("Runtime flag watcher stopped");
    }

    /// 执行一轮轮询，返回每个标志的结果
    pub async fn poll_once(&mut self) -> Vec<(FlagName, PollOutcome)> {
        let mut outcomes = Vec::with_capacity(FlagName::ALL.len());
        for flag in FlagName::ALL {
            let outcome = self.check_flag(flag).await;
            outcomes.push((flag, outcome));
        }
        outcomes
    }

    async fn check_flag(&mut self, flag: FlagName) -> PollOutcome {
        let record = match self.store.read_flag(flag).await {
            Ok(Some(record)) => record,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                tracing::warn!(flag = %flag, "Failed to read runtime flag: {}", e);
                return PollOutcome::Unreadable(e.to_string());
            }
        };
        let Some(request) = FlagRequest::from_record(&record) else {
            return PollOutcome::Idle;
        };

        let last = self.last_handled(flag);
        let baseline = match (last, self.stale_requests) {
            (Some(last), _) => Some(last),
            (None, StaleRequests::Discard) => Some(self.started_at),
            (None, StaleRequests::Replay) => None,
        };

        if baseline.is_some_and(|b| request.requested_at <= b) {
            if last.is_none() {
                tracing::info!(flag = %flag, requested_at = %request.requested_at, "Discarding request issued before watcher start");
                self.clear(flag, request.requested_at).await;
                return PollOutcome::Discarded;
            }
            // 已处理过（清空失败）或早于已处理的请求，只补一次清空
            self.clear(flag, request.requested_at).await;
            tracing::debug!(flag = %flag, requested_at = %request.requested_at, "Request already handled, skipping");
            return PollOutcome::Skipped;
        }

        tracing::info!(flag = %flag, requested_at = %request.requested_at, "Dispatching runtime flag");
        match self.handler.handle(flag, &request).await {
            Ok(()) => {
                self.last_handled.insert(flag, request.requested_at);
                self.clear(flag, request.requested_at).await;
                self.audit.record(
                    AuditKind::FlagHandled,
                    json!({
                        "flag": flag.as_str(),
                        "requestedAt": request.requested_at.to_rfc3339(),
                    }),
                );
                PollOutcome::Handled
            }
            Err(e) => {
                tracing::error!(flag = %flag, "Runtime flag handler failed: {:#}", e);
                self.audit.record(
                    AuditKind::Error,
                    json!({
                        "code": "FLAG_HANDLER_ERROR",
                        "flag": flag.as_str(),
                        "error": format!("{:#}", e),
                    }),
                );
                PollOutcome::Failed(e.to_string())
            }
        }
    }

    /// 只清空刚处理的这次请求；处理期间写入的新请求留给下个周期
    async fn clear(&self, flag: FlagName, requested_at: DateTime<Utc>) {
        match self.store.clear_flag_if(flag, requested_at).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(flag = %flag, "Runtime flag rewritten while handling, keeping newer request")
            }
            Err(e) => tracing::warn!(flag = %flag, "Failed to clear runtime flag: {}", e),
        }
    }
}
