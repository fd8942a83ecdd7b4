//! WA Monitor Worker
//!
//! 维持单个账号到消息网络的长连接，把连接状态与凭据持久化，并通过轮询共享标志表
//! 接收运营方的异步指令。
//!
//! 模块划分：
//! - **audit**: 审计日志（单写入任务，保证顺序）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connection**: 连接状态机、重连策略、管理器 Actor
//! - **core**: 启动错误与优雅关闭
//! - **engine**: 协议引擎抽象与脚本化实现
//! - **flags**: 运行时指令标志与轮询器
//! - **session**: 会话记录与凭据缓存
//! - **storage**: 存储接口（内存 / SQLite）
//! - **worker**: 组装与启停

pub mod audit;
pub mod config;
pub mod connection;
pub mod core;
pub mod engine;
pub mod flags;
#[cfg(feature = "http")]
pub mod http;
pub mod observability;
pub mod session;
pub mod storage;
pub mod worker;

pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use worker::Worker;
