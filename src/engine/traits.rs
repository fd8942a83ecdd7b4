//! 协议引擎抽象
//!
//! Worker 不实现消息网络协议本身，只通过 ProtocolEngine 打开会话，再从事件流里读取
//! 二维码 / 登录成功 / 断开 / 凭据变更，并通过 EngineHandle 执行登出与群组拉取。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{CredentialMaterial, Identity};

/// 服务端返回「已登出」时的关闭状态码
pub const LOGGED_OUT_STATUS: u16 = 401;

/// 引擎事件流
pub type EngineEvents = Pin<Box<dyn Stream<Item = EngineEvent> + Send>>;

/// 引擎在一次会话中陆续发出的事件
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// 需要扫码配对，载荷为二维码字符串
    QrChallenge(String),
    /// 登录成功
    Opened(SessionInfo),
    /// 连接关闭
    Closed(CloseReason),
    /// 认证材料变化，需要写穿
    CredentialsChanged(CredentialMaterial),
}

/// 登录成功后引擎给出的账号信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// 形如 `15551234567:12@s.whatsapp.net`
    pub jid: String,
    pub name: Option<String>,
    pub push_name: Option<String>,
}

impl SessionInfo {
    /// 展示名取 name，缺省用 push_name；号码取 JID 中 ':' 与 '@' 之前的部分
    pub fn identity(&self) -> Identity {
        let display_name = self
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| self.push_name.as_deref().filter(|n| !n.trim().is_empty()))
            .map(str::to_string);
        let account_number = self
            .jid
            .split(['@', ':'])
            .next()
            .unwrap_or_default()
            .to_string();
        Identity {
            display_name,
            account_number,
        }
    }
}

/// 关闭原因
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    pub status_code: Option<u16>,
    pub message: Option<String>,
    /// 引擎明确报告会话已被登出
    pub logged_out: bool,
}

impl CloseReason {
    pub fn logged_out() -> Self {
        Self {
            status_code: Some(LOGGED_OUT_STATUS),
            message: Some("logged out".into()),
            logged_out: true,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: Some(message.into()),
            logged_out: false,
        }
    }

    pub fn with_status(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            message: None,
            logged_out: status_code == LOGGED_OUT_STATUS,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out || self.status_code == Some(LOGGED_OUT_STATUS)
    }

    /// 写入审计与日志的简短描述
    pub fn describe(&self) -> String {
        match (self.status_code, self.message.as_deref()) {
            (Some(code), Some(msg)) => format!("{} ({})", msg, code),
            (Some(code), None) => format!("status {}", code),
            (None, Some(msg)) => msg.to_string(),
            (None, None) => "connection closed".to_string(),
        }
    }
}

/// 群组发现结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub participants: Option<u32>,
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine rejected request: {0}")]
    Rejected(String),

    #[error("Session closed")]
    Closed,

    #[error("Engine call timed out")]
    Timeout,
}

/// 一次打开得到的会话：操作句柄 + 事件流
pub struct EngineSession {
    pub handle: Arc<dyn EngineHandle>,
    pub events: EngineEvents,
}

/// 协议引擎
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// 以给定凭据打开会话；空凭据走首次配对流程
    async fn open(&self, credentials: CredentialMaterial) -> Result<EngineSession, EngineError>;
}

/// 已打开会话上的操作
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// 登出：服务端注销此设备
    async fn logout(&self) -> Result<(), EngineError>;

    async fn fetch_groups(&self) -> Result<Vec<GroupInfo>, EngineError>;

    /// 放弃此会话（不登出）；默认什么都不做
    fn close(&self) {}
}
