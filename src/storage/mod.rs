//! 存储抽象层
//!
//! Worker 只通过 `Storage` 这一窄接口读写共享状态：唯一的会话记录、运行时指令标志、
//! 审计日志以及群组发现结果。提供内存与 SQLite 两种实现。

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::AuditEntry;
use crate::engine::GroupInfo;
use crate::flags::FlagName;
use crate::session::{SessionRecord, SessionUpdate};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session record missing")]
    SessionMissing,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// runtime_flags 表中的一行；value 为 None 表示空闲
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRecord {
    pub name: FlagName,
    pub value: Option<serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// 持久化接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 读取会话记录；不存在返回 None
    async fn read_session(&self) -> Result<Option<SessionRecord>, StorageError>;

    /// 确保会话记录存在（不存在则以 disconnected 创建），返回当前记录
    async fn ensure_session(&self) -> Result<SessionRecord, StorageError>;

    /// 合并写入：只修改 update 中给出的字段，并打上 last_status_at
    async fn write_session(&self, update: &SessionUpdate) -> Result<(), StorageError>;

    async fn read_flag(&self, name: FlagName) -> Result<Option<FlagRecord>, StorageError>;

    async fn write_flag(&self, name: FlagName, value: serde_json::Value) -> Result<(), StorageError>;

    /// 把标志置空（value = NULL）
    async fn clear_flag(&self, name: FlagName) -> Result<(), StorageError>;

    /// 仅当标志中仍是 requested_at 这次请求时置空；返回是否清空。
    /// 处理期间写入的更新请求保持不动
    async fn clear_flag_if(
        &self,
        name: FlagName,
        requested_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError>;

    /// 写入发现到的群组（按群组 ID 去重），返回处理条数
    async fn upsert_groups(&self, groups: &[GroupInfo]) -> Result<usize, StorageError>;
}
