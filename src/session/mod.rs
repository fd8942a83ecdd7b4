//! 会话：唯一的持久化会话记录与凭据缓存

mod credentials;
mod record;

pub use credentials::{CredentialCache, CredentialError, CredentialMaterial};
pub use record::{
    Identity, QrChallenge, SessionDetail, SessionRecord, SessionStatus, SessionUpdate,
};
