//! 运行时指令标志
//!
//! 控制面（Dashboard / API）把运营方请求写入 runtime_flags 表，Worker 轮询读取后
//! 以「时间戳前进」为边沿触发执行，执行成功后清空标志。

mod dispatch;
mod watcher;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::FlagRecord;

pub use watcher::{FlagHandler, FlagWatcher, PollOutcome};

/// 固定的指令集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagName {
    /// 触发群组发现
    FetchGroups,
    /// 刷新二维码 / 重新发起配对
    RefreshQr,
    /// 登出并断开
    Disconnect,
}

impl FlagName {
    pub const ALL: [FlagName; 3] = [FlagName::FetchGroups, FlagName::RefreshQr, FlagName::Disconnect];

    /// runtime_flags.name 中的存储名
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagName::FetchGroups => "fetch_groups_requested",
            FlagName::RefreshQr => "wa_refresh_qr_requested",
            FlagName::Disconnect => "wa_disconnect_requested",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for FlagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 重启前遗留的未清空请求如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleRequests {
    /// 重启后再执行一次（内存中的 lastHandled 已丢失）
    #[default]
    Replay,
    /// 早于 Watcher 启动时间的请求直接清空，不执行
    Discard,
}

/// 一条待处理的运营方请求
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRequest {
    pub requested_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl FlagRequest {
    /// 从标志行解析；空闲（NULL / 空对象）或拿不到时间戳时返回 None
    ///
    /// 时间戳优先取 value.requestedAt，其次兼容旧字段 value.at，最后退回行的 updated_at。
    pub fn from_record(record: &FlagRecord) -> Option<Self> {
        let value = record.value.as_ref()?;
        let is_idle = match value {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if is_idle {
            return None;
        }

        let requested_at = ["requestedAt", "at"]
            .into_iter()
            .find_map(|key| value.get(key).and_then(parse_timestamp))
            .or(record.updated_at)?;

        Some(Self {
            requested_at,
            payload: value.clone(),
        })
    }
}

/// 控制面写入标志时使用的标准 value
pub fn request_value(requested_at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({ "requestedAt": requested_at.to_rfc3339() })
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}
