//! 连接状态与对外发布的状态快照

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::policy::DisconnectCause;
use crate::session::{Identity, SessionStatus};

/// 连接状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum ConnectionState {
    /// 尚未开始连接
    Idle,
    Connecting,
    Connected,
    Disconnected(DisconnectCause),
    /// 已停止（终态）
    Stopped,
}

impl ConnectionState {
    /// 对应的持久化状态；Idle 尚未写过状态，按 disconnected 处理
    pub fn session_status(&self) -> SessionStatus {
        match self {
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Connected => SessionStatus::Connected,
            _ => SessionStatus::Disconnected,
        }
    }

    /// 处于 Connecting / Connected，即存在活动会话
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// 状态快照（通过 watch 通道发布）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    #[serde(flatten)]
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    /// 当前有效的二维码
    pub qr: Option<String>,
    pub qr_expires_at: Option<DateTime<Utc>>,
    /// 连续重连次数
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionSnapshot {
    pub fn initial() -> Self {
        Self {
            state: ConnectionState::Idle,
            identity: None,
            qr: None,
            qr_expires_at: None,
            attempts: 0,
            next_retry_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.session_status()
    }

    /// 去掉 now 时刻已过期的二维码
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        if self.qr_expires_at.map_or(true, |expires_at| expires_at <= now) {
            self.qr = None;
            self.qr_expires_at = None;
        }
        self
    }
}
