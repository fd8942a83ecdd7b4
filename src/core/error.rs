//! 宿主层错误
//!
//! 启动阶段的失败（配置不合法、会话记录无法读取或创建）是致命的，宿主应立即退出；
//! 运行期的失败都在各组件内部记录日志与审计，不会冒泡到这里。

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// 会话记录无法读取或创建
    #[error("Session record unavailable: {0}")]
    SessionUnavailable(#[source] StorageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
