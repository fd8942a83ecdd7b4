//! 连接管理器：单 Actor 串行处理所有状态迁移
//!
//! 协议引擎事件、重连定时器与运营方指令都被转换成 Command 投递到同一个通道，
//! 由一个任务逐条处理；I/O 在处理单条命令期间完成，不会与其它迁移交错。
//!
//! 每次打开引擎会话时递增 generation，转发任务给事件打上 generation；
//! 会话被替换或关闭后，旧会话迟到的事件因 generation 不匹配而被丢弃。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::policy::{DisconnectCause, ReconnectPolicy, RetryDecision};
use super::state::{ConnectionSnapshot, ConnectionState};
use crate::audit::{AuditKind, AuditSink};
use crate::config::AppConfig;
use crate::engine::{
    CloseReason, EngineError, EngineEvent, EngineEvents, EngineHandle, ProtocolEngine, SessionInfo,
};
use crate::session::{
    CredentialCache, CredentialError, CredentialMaterial, Identity, QrChallenge, SessionDetail,
    SessionStatus, SessionUpdate,
};
use crate::storage::{Storage, StorageError};

/// 连接管理器的可调参数
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// 二维码有效期
    pub qr_ttl: Duration,
    /// 登出的最长等待
    pub logout_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            qr_ttl: Duration::from_secs(60),
            logout_timeout: Duration::from_secs(5),
            policy: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            qr_ttl: Duration::from_secs(config.session.qr_ttl_secs),
            logout_timeout: Duration::from_secs(config.session.logout_timeout_secs),
            policy: ReconnectPolicy::from_config(&config.reconnect),
        }
    }
}

/// 构造管理器所需的协作者
pub struct ConnectionDeps {
    pub engine: Arc<dyn ProtocolEngine>,
    pub store: Arc<dyn Storage>,
    pub credentials: Arc<CredentialCache>,
    pub audit: AuditSink,
    pub options: ConnectionOptions,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection manager stopped")]
    Stopped,

    #[error("Not connected")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),
}

/// 运营方断开的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// 活动会话已登出
    LoggedOut,
    /// 本来就没有活动会话，只清理了凭据
    AlreadyDisconnected,
}

/// 刷新二维码的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrRefreshOutcome {
    /// 重建了正在配对的会话
    Restarted,
    /// 从空闲 / 断开状态发起了新连接
    Started,
    /// 已连接，无需刷新
    AlreadyConnected,
}

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Command {
    Start(Reply<()>),
    Engine { generation: u64, event: EngineEvent },
    EngineEnded { generation: u64 },
    RetryDue { retry_id: u64 },
    Disconnect(Reply<DisconnectOutcome>),
    RefreshQr(Reply<QrRefreshOutcome>),
    LiveHandle(oneshot::Sender<Option<Arc<dyn EngineHandle>>>),
    Inspect(oneshot::Sender<ConnectionSnapshot>),
    Stop(oneshot::Sender<()>),
}

/// 连接管理器句柄（可克隆）
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    shutdown: CancellationToken,
    store: Arc<dyn Storage>,
    audit: AuditSink,
}

impl ConnectionManager {
    /// 启动 Actor 任务；此时仍处于 Idle，需调用 start()
    pub fn spawn(deps: ConnectionDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(ConnectionSnapshot::initial());
        let shutdown = CancellationToken::new();
        let store = deps.store.clone();
        let audit = deps.audit.clone();

        let actor = Actor::new(deps, tx.clone(), snapshot_tx, shutdown.clone());
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            snapshot,
            shutdown,
            store,
            audit,
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| ConnectionError::Stopped)?;
        reply_rx.await.map_err(|_| ConnectionError::Stopped)?
    }

    /// Idle / 已登出 → Connecting：加载凭据并打开引擎
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.call(Command::Start).await
    }

    /// 登出并清除凭据，进入 Disconnected(LoggedOut)
    pub async fn request_disconnect(&self) -> Result<DisconnectOutcome, ConnectionError> {
        self.call(Command::Disconnect).await
    }

    /// 获取新的二维码；已连接时什么都不做
    pub async fn request_qr_refresh(&self) -> Result<QrRefreshOutcome, ConnectionError> {
        self.call(Command::RefreshQr).await
    }

    /// 拉取账号所在群组并写入存储，返回群组数；未连接时返回 NotConnected
    pub async fn request_discovery(&self) -> Result<usize, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::LiveHandle(reply_tx))
            .map_err(|_| ConnectionError::Stopped)?;
        let handle = reply_rx
            .await
            .map_err(|_| ConnectionError::Stopped)?
            .ok_or(ConnectionError::NotConnected)?;

        let groups = handle.fetch_groups().await?;
        let count = self.store.upsert_groups(&groups).await?;
        self.audit.record(
            AuditKind::Discovery,
            json!({ "triggered": "flag", "groups": count }),
        );
        tracing::info!(groups = count, "Group discovery completed");
        Ok(count)
    }

    /// 由 Actor 在处理完此前所有命令后给出的快照
    pub async fn current(&self) -> Result<ConnectionSnapshot, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Inspect(reply_tx))
            .map_err(|_| ConnectionError::Stopped)?;
        reply_rx.await.map_err(|_| ConnectionError::Stopped)
    }

    /// 进入 Stopped：取消重连定时器与关闭令牌，尽力登出
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 最近一次发布的快照
    /// 最近发布的快照；发布后才过期的二维码在这里剔除
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone().at(Utc::now())
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// stop() 时被取消的令牌，供 Watcher 等后台任务挂靠
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

struct LiveSession {
    handle: Arc<dyn EngineHandle>,
    token: CancellationToken,
}

struct PendingRetry {
    id: u64,
    at: DateTime<Utc>,
    token: CancellationToken,
}

struct Actor {
    engine: Arc<dyn ProtocolEngine>,
    store: Arc<dyn Storage>,
    credentials: Arc<CredentialCache>,
    audit: AuditSink,
    options: ConnectionOptions,
    tx: mpsc::UnboundedSender<Command>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    shutdown: CancellationToken,

    state: ConnectionState,
    attempts: u32,
    generation: u64,
    retry_seq: u64,
    credentials_loaded: bool,
    session: Option<LiveSession>,
    retry: Option<PendingRetry>,
    qr: Option<QrChallenge>,
    identity: Option<Identity>,
    /// 最近一次凭据写穿任务
    credential_flush: Option<JoinHandle<()>>,
}

impl Actor {
    fn new(
        deps: ConnectionDeps,
        tx: mpsc::UnboundedSender<Command>,
        snapshot_tx: watch::Sender<ConnectionSnapshot>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine: deps.engine,
            store: deps.store,
            credentials: deps.credentials,
            audit: deps.audit,
            options: deps.options,
            tx,
            snapshot_tx,
            shutdown,
            state: ConnectionState::Idle,
            attempts: 0,
            generation: 0,
            retry_seq: 0,
            credentials_loaded: false,
            session: None,
            retry: None,
            qr: None,
            identity: None,
            credential_flush: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        tracing::debug!("Connection actor finished");
    }

    /// 处理一条命令；返回 false 表示 Actor 应退出
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Engine { generation, event } => {
                if generation != self.generation {
                    tracing::debug!(generation, current = self.generation, "Ignoring event from superseded session");
                } else {
                    self.on_engine_event(event).await;
                }
            }
            Command::EngineEnded { generation } => {
                if generation == self.generation {
                    self.on_closed(CloseReason::transient("event stream ended")).await;
                }
            }
            Command::RetryDue { retry_id } => self.on_retry_due(retry_id).await,
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::RefreshQr(reply) => {
                let _ = reply.send(self.refresh_qr().await);
            }
            Command::LiveHandle(reply) => {
                let handle = match self.state {
                    ConnectionState::Connected => self.session.as_ref().map(|s| s.handle.clone()),
                    _ => None,
                };
                let _ = reply.send(handle);
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::Stop(ack) => {
                self.stop().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::QrChallenge(qr) => self.on_qr(qr).await,
            EngineEvent::Opened(info) => self.on_opened(info).await,
            EngineEvent::Closed(reason) => self.on_closed(reason).await,
            EngineEvent::CredentialsChanged(material) => self.on_credentials(material).await,
        }
    }

    async fn start(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Stopped => return Err(ConnectionError::Stopped),
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!("Start requested while already {:?}", self.state);
                return Ok(());
            }
            ConnectionState::Idle | ConnectionState::Disconnected(_) => {}
        }

        let material = if self.credentials_loaded {
            self.credentials.current().await
        } else {
            let material = self.credentials.load().await?;
            self.credentials_loaded = true;
            material
        };

        self.cancel_retry();
        self.attempts = 0;
        self.connect(material).await;
        Ok(())
    }

    async fn connect(&mut self, material: CredentialMaterial) {
        self.retire_session();
        let generation = self.generation;
        self.state = ConnectionState::Connecting;
        self.qr = None;
        self.identity = None;
        self.persist(
            SessionUpdate::new()
                .status(SessionStatus::Connecting)
                .detail(None)
                .identity(None),
        )
        .await;
        self.publish();

        tracing::info!(
            generation,
            attempt = self.attempts,
            fresh_pairing = material.is_empty(),
            "Opening protocol engine session"
        );
        match self.engine.open(material).await {
            Ok(session) => {
                let token = self.shutdown.child_token();
                self.spawn_forwarder(generation, session.events, token.clone());
                self.session = Some(LiveSession {
                    handle: session.handle,
                    token,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to open protocol engine: {}", e);
                self.on_closed(CloseReason::transient(e.to_string())).await;
            }
        }
    }

    fn spawn_forwarder(&self, generation: u64, mut events: EngineEvents, token: CancellationToken) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            if tx.send(Command::Engine { generation, event }).is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(Command::EngineEnded { generation });
                            break;
                        }
                    },
                }
            }
        });
    }

    async fn on_qr(&mut self, qr: String) {
        if self.state != ConnectionState::Connecting {
            tracing::debug!("Discarding QR challenge received while {:?}", self.state);
            return;
        }

        let challenge = QrChallenge::issue(qr, self.options.qr_ttl);
        self.persist(
            SessionUpdate::new()
                .status(SessionStatus::Connecting)
                .detail(Some(SessionDetail::from(&challenge))),
        )
        .await;
        self.audit.record(
            AuditKind::QrGenerated,
            json!({ "expiresAt": challenge.expires_at.to_rfc3339() }),
        );
        tracing::info!(expires_at = %challenge.expires_at, "QR challenge issued");
        self.qr = Some(challenge);
        self.publish();
    }

    async fn on_opened(&mut self, info: SessionInfo) {
        if !self.state.is_live() {
            tracing::debug!("Ignoring open event while {:?}", self.state);
            return;
        }

        let identity = info.identity();
        self.attempts = 0;
        self.state = ConnectionState::Connected;
        self.qr = None;
        self.persist(
            SessionUpdate::new()
                .status(SessionStatus::Connected)
                .identity(Some(identity.clone()))
                .detail(None),
        )
        .await;
        // 失败已在缓存内记录，内存副本仍有效，下次变更会再写
        let _ = self.credentials.flush().await;

        self.audit.record(
            AuditKind::Connect,
            json!({
                "name": &identity.display_name,
                "number": &identity.account_number,
            }),
        );
        tracing::info!(
            "Connected as {} ({})",
            identity.display_name.as_deref().unwrap_or("unknown"),
            identity.account_number
        );
        self.identity = Some(identity);
        self.publish();
    }

    async fn on_closed(&mut self, reason: CloseReason) {
        if !self.state.is_live() {
            tracing::debug!("Ignoring close event while {:?}", self.state);
            return;
        }

        let cause = DisconnectCause::classify(&reason);
        let decision = self.options.policy.evaluate(self.attempts, cause);
        self.retire_session();
        self.state = ConnectionState::Disconnected(cause);
        self.qr = None;
        self.identity = None;
        self.persist(
            SessionUpdate::new()
                .status(SessionStatus::Disconnected)
                .identity(None)
                .detail(None),
        )
        .await;
        self.audit.record(
            AuditKind::Disconnect,
            json!({
                "cause": cause.as_str(),
                "reason": reason.describe(),
                "shouldReconnect": decision.should_retry,
                "attempt": decision.attempt,
            }),
        );
        tracing::info!(
            cause = cause.as_str(),
            should_reconnect = decision.should_retry,
            "Disconnected: {}",
            reason.describe()
        );

        if decision.should_retry {
            self.schedule_retry(decision);
        } else if cause == DisconnectCause::Transient {
            tracing::warn!(attempts = self.attempts, "Reconnect attempts exhausted, waiting for operator");
        }
        self.publish();
    }

    async fn on_credentials(&mut self, material: CredentialMaterial) {
        self.credentials.replace(material).await;
        let credentials = self.credentials.clone();
        // 失败时内存副本保持 dirty，stop() 会再补写一次
        self.credential_flush = Some(tokio::spawn(async move {
            let _ = credentials.flush().await;
        }));
    }

    /// 等待在途写穿结束，再把仍未落库的凭据写一次
    async fn settle_credentials(&mut self) {
        if let Some(task) = self.credential_flush.take() {
            if let Err(e) = task.await {
                tracing::warn!("Credential flush task failed: {}", e);
            }
        }
        if let Err(e) = self.credentials.flush().await {
            tracing::error!("Credentials not persisted before stop: {}", e);
        }
    }

    fn schedule_retry(&mut self, decision: RetryDecision) {
        self.cancel_retry();
        self.retry_seq += 1;
        let retry_id = self.retry_seq;
        self.attempts = decision.attempt;

        let token = self.shutdown.child_token();
        let delay = decision.delay;
        let at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let tx = self.tx.clone();
        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::RetryDue { retry_id });
                }
            }
        });
        self.retry = Some(PendingRetry {
            id: retry_id,
            at,
            token,
        });

        self.audit.record(
            AuditKind::Reconnect,
            json!({ "attempt": decision.attempt, "delayMs": delay.as_millis() as u64 }),
        );
        tracing::info!(
            attempt = decision.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.token.cancel();
            tracing::debug!(retry_id = retry.id, "Pending reconnect cancelled");
        }
    }

    async fn on_retry_due(&mut self, retry_id: u64) {
        match &self.retry {
            Some(retry) if retry.id == retry_id => self.retry = None,
            _ => {
                tracing::debug!(retry_id, "Ignoring cancelled reconnect timer");
                return;
            }
        }
        if self.state != ConnectionState::Disconnected(DisconnectCause::Transient) {
            return;
        }
        let material = self.credentials.current().await;
        self.connect(material).await;
    }

    async fn disconnect(&mut self) -> Result<DisconnectOutcome, ConnectionError> {
        if self.state == ConnectionState::Stopped {
            return Err(ConnectionError::Stopped);
        }

        self.cancel_retry();
        let was_live = self.state.is_live();
        if let Some(handle) = self.session.as_ref().map(|s| s.handle.clone()) {
            self.logout(handle).await;
        }
        self.retire_session();

        let logged_out = ConnectionState::Disconnected(DisconnectCause::LoggedOut);
        if self.state != logged_out {
            self.state = logged_out;
            self.qr = None;
            self.identity = None;
            self.persist(
                SessionUpdate::new()
                    .status(SessionStatus::Disconnected)
                    .identity(None)
                    .detail(None),
            )
            .await;
            self.audit.record(
                AuditKind::Disconnect,
                json!({
                    "cause": DisconnectCause::LoggedOut.as_str(),
                    "reason": "operator request",
                    "shouldReconnect": false,
                }),
            );
            self.publish();
        }

        self.credentials.clear().await?;
        self.credentials_loaded = true;
        tracing::info!(was_live, "Session logged out by operator");

        Ok(if was_live {
            DisconnectOutcome::LoggedOut
        } else {
            DisconnectOutcome::AlreadyDisconnected
        })
    }

    async fn refresh_qr(&mut self) -> Result<QrRefreshOutcome, ConnectionError> {
        match self.state {
            ConnectionState::Stopped => Err(ConnectionError::Stopped),
            ConnectionState::Connected => {
                tracing::info!("QR refresh requested while connected, nothing to do");
                Ok(QrRefreshOutcome::AlreadyConnected)
            }
            ConnectionState::Connecting => {
                tracing::info!("Restarting pairing session for a fresh QR challenge");
                let material = self.credentials.current().await;
                self.connect(material).await;
                Ok(QrRefreshOutcome::Restarted)
            }
            ConnectionState::Idle | ConnectionState::Disconnected(_) => {
                self.start().await?;
                Ok(QrRefreshOutcome::Started)
            }
        }
    }

    async fn stop(&mut self) {
        if self.state == ConnectionState::Stopped {
            return;
        }

        self.cancel_retry();
        self.shutdown.cancel();
        if let Some(handle) = self.session.as_ref().map(|s| s.handle.clone()) {
            self.logout(handle).await;
        }
        self.retire_session();
        self.settle_credentials().await;

        self.state = ConnectionState::Stopped;
        self.qr = None;
        self.identity = None;
        self.persist(
            SessionUpdate::new()
                .status(SessionStatus::Disconnected)
                .identity(None)
                .detail(None),
        )
        .await;
        self.audit.record(
            AuditKind::Disconnect,
            json!({ "cause": "manual", "reason": "manual", "shouldReconnect": false }),
        );
        self.publish();
        tracing::info!("Connection manager stopped");
    }

    async fn logout(&self, handle: Arc<dyn EngineHandle>) {
        match tokio::time::timeout(self.options.logout_timeout, handle.logout()).await {
            Ok(Ok(())) => tracing::debug!("Engine logout completed"),
            Ok(Err(e)) => tracing::warn!("Engine logout failed: {}", e),
            Err(_) => tracing::warn!(
                "Engine logout timed out after {:?}",
                self.options.logout_timeout
            ),
        }
    }

    /// 放弃当前引擎会话；之后它发出的事件都会被忽略
    fn retire_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.token.cancel();
            session.handle.close();
        }
        self.generation += 1;
    }

    async fn persist(&self, update: SessionUpdate) {
        if let Err(e) = self.store.write_session(&update).await {
            tracing::warn!("Failed to persist session state: {}", e);
        }
    }

    fn build_snapshot(&self) -> ConnectionSnapshot {
        let now = Utc::now();
        let qr = self.qr.as_ref().filter(|c| !c.is_expired_at(now));
        ConnectionSnapshot {
            state: self.state,
            identity: self.identity.clone(),
            qr: qr.map(|c| c.qr.clone()),
            qr_expires_at: qr.map(|c| c.expires_at),
            attempts: self.attempts,
            next_retry_at: self.retry.as_ref().map(|r| r.at),
            updated_at: now,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.build_snapshot());
    }
}
