//! 连接生命周期：状态机、重连策略与管理器

mod manager;
mod policy;
mod state;

pub use manager::{
    ConnectionDeps, ConnectionError, ConnectionManager, ConnectionOptions, DisconnectOutcome,
    QrRefreshOutcome,
};
pub use policy::{DisconnectCause, ReconnectPolicy, RetryDecision};
pub use state::{ConnectionSnapshot, ConnectionState};
