//! 脚本化引擎（测试与本地联调用，不连接真实网络）
//!
//! 每次 open 生成一个 ScriptedSession，由测试或 stdin 脚本向其注入事件。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;

use super::traits::{
    CloseReason, EngineError, EngineEvent, EngineHandle, EngineSession, GroupInfo,
    ProtocolEngine, SessionInfo,
};
use crate::session::CredentialMaterial;

#[derive(Default)]
struct EngineState {
    failing_opens: usize,
    hang_logout: bool,
    opened_with: Vec<CredentialMaterial>,
    sessions: Vec<Arc<ScriptedSession>>,
}

/// 脚本化引擎
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<EngineState>,
    groups: Arc<Mutex<Vec<GroupInfo>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来 n 次 open 直接失败
    pub fn fail_next_opens(&self, n: usize) {
        lock(&self.state).failing_opens = n;
    }

    /// 之后打开的会话 logout 永不返回
    pub fn hang_logout(&self, hang: bool) {
        lock(&self.state).hang_logout = hang;
    }

    pub fn set_groups(&self, groups: Vec<GroupInfo>) {
        *lock(&self.groups) = groups;
    }

    pub fn add_group(&self, group: GroupInfo) {
        lock(&self.groups).push(group);
    }

    /// open 被调用的次数（含失败）
    pub fn open_count(&self) -> usize {
        lock(&self.state).opened_with.len()
    }

    /// 第 i 次 open 收到的凭据
    pub fn opened_with(&self, index: usize) -> Option<CredentialMaterial> {
        lock(&self.state).opened_with.get(index).cloned()
    }

    /// 第 i 个成功打开的会话
    pub fn session(&self, index: usize) -> Option<Arc<ScriptedSession>> {
        lock(&self.state).sessions.get(index).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn latest(&self) -> Option<Arc<ScriptedSession>> {
        lock(&self.state).sessions.last().cloned()
    }

    /// 执行一行脚本命令，作用于最新会话：
    ///
    /// ```text
    /// qr <data>
    /// open <jid> [name]
    /// close [status]
    /// creds <json>
    /// group <id> <subject>
    /// ```
    pub fn apply_script_line(&self, line: &str) -> Result<(), String> {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        if command == "group" {
            let (id, subject) = rest
                .split_once(' ')
                .ok_or_else(|| "usage: group <id> <subject>".to_string())?;
            self.add_group(GroupInfo {
                id: id.to_string(),
                subject: subject.trim().to_string(),
                participants: None,
            });
            return Ok(());
        }

        let session = self.latest().ok_or_else(|| "no open session".to_string())?;
        match command {
            "qr" if !rest.is_empty() => session.qr(rest),
            "open" if !rest.is_empty() => {
                let (jid, name) = match rest.split_once(' ') {
                    Some((jid, name)) => (jid, Some(name.trim().to_string())),
                    None => (rest, None),
                };
                session.opened(SessionInfo {
                    jid: jid.to_string(),
                    name,
                    push_name: None,
                })
            }
            "close" => {
                let reason = if rest.is_empty() {
                    CloseReason::transient("connection lost")
                } else {
                    let code = rest
                        .parse::<u16>()
                        .map_err(|_| format!("invalid status code: {}", rest))?;
                    CloseReason::with_status(code)
                };
                session.closed(reason)
            }
            "creds" if !rest.is_empty() => {
                let value: serde_json::Value =
                    serde_json::from_str(rest).map_err(|e| format!("invalid json: {}", e))?;
                session.credentials(CredentialMaterial::new(value))
            }
            _ => return Err(format!("unknown command: {}", line)),
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolEngine for ScriptedEngine {
    async fn open(&self, credentials: CredentialMaterial) -> Result<EngineSession, EngineError> {
        let mut state = lock(&self.state);
        state.opened_with.push(credentials);
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(EngineError::Transport("scripted open failure".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ScriptedSession {
            tx: Mutex::new(Some(tx)),
            groups: self.groups.clone(),
            hang_logout: state.hang_logout,
            logouts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        state.sessions.push(session.clone());

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(EngineSession {
            handle: session,
            events: Box::pin(events),
        })
    }
}

/// 一次脚本化会话
pub struct ScriptedSession {
    tx: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    groups: Arc<Mutex<Vec<GroupInfo>>>,
    hang_logout: bool,
    logouts: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedSession {
    /// 注入一个事件；会话已结束时静默丢弃
    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn qr(&self, data: &str) {
        self.emit(EngineEvent::QrChallenge(data.to_string()));
    }

    pub fn opened(&self, info: SessionInfo) {
        self.emit(EngineEvent::Opened(info));
    }

    pub fn closed(&self, reason: CloseReason) {
        self.emit(EngineEvent::Closed(reason));
    }

    pub fn credentials(&self, material: CredentialMaterial) {
        self.emit(EngineEvent::CredentialsChanged(material));
    }

    /// 结束事件流（模拟底层连接直接消失）
    pub fn end_stream(&self) {
        lock(&self.tx).take();
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    /// 是否已被 Worker 放弃
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineHandle for ScriptedSession {
    async fn logout(&self) -> Result<(), EngineError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.hang_logout {
            std::future::pending::<()>().await;
        }
        self.closed(CloseReason::logged_out());
        Ok(())
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupInfo>, EngineError> {
        if self.is_closed() || lock(&self.tx).is_none() {
            return Err(EngineError::Closed);
        }
        Ok(lock(&self.groups).clone())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.end_stream();
    }
}
