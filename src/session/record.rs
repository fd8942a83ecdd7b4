//! 会话记录：整个进程生命周期内唯一的一行持久化状态
//!
//! 状态机写 status / identity / detail，凭据缓存写 credentials；
//! 所有写入都通过 SessionUpdate 以「合并」语义落库，只改动显式给出的字段。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credentials::CredentialMaterial;

/// 持久化的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    /// 从数据库文本解析；未知值按 disconnected 处理
    pub fn from_db(s: &str) -> Self {
        match s {
            "connecting" => SessionStatus::Connecting,
            "connected" => SessionStatus::Connected,
            _ => SessionStatus::Disconnected,
        }
    }
}

/// 二维码挑战（只在 connecting 期间存在）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrChallenge {
    pub qr: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QrChallenge {
    /// 以当前时间签发，有效期为 ttl
    pub fn issue(qr: impl Into<String>, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            qr: qr.into(),
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// detail 字段的结构化内容：{"qr": "...", "expiresAt": "..."}
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&QrChallenge> for SessionDetail {
    fn from(challenge: &QrChallenge) -> Self {
        Self {
            qr: Some(challenge.qr.clone()),
            expires_at: Some(challenge.expires_at),
        }
    }
}

/// 已登录账号的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub display_name: Option<String>,
    pub account_number: String,
}

/// 会话记录（对应 wa_sessions 表的唯一一行）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub detail: Option<SessionDetail>,
    pub identity: Option<Identity>,
    #[serde(skip)]
    pub credentials: CredentialMaterial,
    pub last_status_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// 首次启动时创建的初始行：disconnected，无身份、无凭据
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Disconnected,
            detail: None,
            identity: None,
            credentials: CredentialMaterial::empty(),
            last_status_at: None,
        }
    }

    /// 仍在有效期内的二维码；过期的二维码即使还存着也视为不存在
    pub fn active_qr(&self, now: DateTime<Utc>) -> Option<&str> {
        let detail = self.detail.as_ref()?;
        let qr = detail.qr.as_deref()?;
        match detail.expires_at {
            Some(expires_at) if expires_at > now => Some(qr),
            _ => None,
        }
    }

    /// identity 当且仅当 connected 时存在；connected 时不得残留二维码
    pub fn is_consistent(&self) -> bool {
        let connected = self.status == SessionStatus::Connected;
        let has_qr = self.detail.as_ref().is_some_and(|d| d.qr.is_some());
        self.identity.is_some() == connected && !(connected && has_qr)
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// 部分更新：None 表示「不改动」，Some(None) 表示「清空」
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub detail: Option<Option<SessionDetail>>,
    pub identity: Option<Option<Identity>>,
    pub credentials: Option<CredentialMaterial>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn detail(mut self, detail: Option<SessionDetail>) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn credentials(mut self, credentials: CredentialMaterial) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// 合并到记录上，并打上 last_status_at 时间戳
    pub fn apply_to(&self, record: &mut SessionRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(detail) = &self.detail {
            record.detail = detail.clone();
        }
        if let Some(identity) = &self.identity {
            record.identity = identity.clone();
        }
        if let Some(credentials) = &self.credentials {
            record.credentials = credentials.clone();
        }
        record.last_status_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            display_name: Some("Ops".to_string()),
            account_number: "15551234567".to_string(),
        }
    }

    #[test]
    fn test_update_merges_only_given_fields() {
        let mut record = SessionRecord::new();
        record.identity = Some(identity());
        record.credentials = CredentialMaterial::new(serde_json::json!({"creds": {"me": 1}}));

        let now = Utc::now();
        SessionUpdate::new()
            .status(SessionStatus::Connecting)
            .apply_to(&mut record, now);

        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.identity, Some(identity()));
        assert!(!record.credentials.is_empty());
        assert_eq!(record.last_status_at, Some(now));
    }

    #[test]
    fn test_update_can_clear_fields() {
        let mut record = SessionRecord::new();
        record.identity = Some(identity());
        record.detail = Some(SessionDetail {
            qr: Some("ABC".into()),
            expires_at: None,
        });

        SessionUpdate::new()
            .detail(None)
            .identity(None)
            .apply_to(&mut record, Utc::now());

        assert!(record.detail.is_none());
        assert!(record.identity.is_none());
    }

    #[test]
    fn test_expired_qr_is_absent() {
        let mut record = SessionRecord::new();
        record.status = SessionStatus::Connecting;
        let now = Utc::now();
        record.detail = Some(SessionDetail {
            qr: Some("ABC123".into()),
            expires_at: Some(now - chrono::Duration::seconds(1)),
        });
        assert_eq!(record.active_qr(now), None);

        record.detail = Some(SessionDetail {
            qr: Some("ABC123".into()),
            expires_at: Some(now + chrono::Duration::seconds(30)),
        });
        assert_eq!(record.active_qr(now), Some("ABC123"));
    }

    #[test]
    fn test_consistency_rules() {
        let mut record = SessionRecord::new();
        assert!(record.is_consistent());

        record.identity = Some(identity());
        assert!(!record.is_consistent());

        record.status = SessionStatus::Connected;
        assert!(record.is_consistent());

        record.detail = Some(SessionDetail {
            qr: Some("stale".into()),
            expires_at: None,
        });
        assert!(!record.is_consistent());
    }

    #[test]
    fn test_detail_json_shape() {
        let challenge = QrChallenge::issue("ABC123", Duration::from_secs(60));
        let detail = SessionDetail::from(&challenge);
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["qr"], "ABC123");
        assert!(json["expiresAt"].is_string());
        assert!(!challenge.is_expired_at(challenge.issued_at));
        assert!(challenge.is_expired_at(challenge.expires_at));
    }
}
