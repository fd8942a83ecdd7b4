//! 协议引擎：抽象接口与脚本化实现

pub mod mock;
pub mod traits;

pub use mock::{ScriptedEngine, ScriptedSession};
pub use traits::{
    CloseReason, EngineError, EngineEvent, EngineEvents, EngineHandle, EngineSession, GroupInfo,
    ProtocolEngine, SessionInfo, LOGGED_OUT_STATUS,
};
