//! 凭据缓存：内存中的认证材料 + 写穿到会话记录
//!
//! - 内存副本始终是权威值；落库失败只记录日志并返回可重试错误，不会清空内存
//! - 写穿串行执行：持有 `persisted` 锁期间完成一次写入，并且总是写「当前最新」的材料，
//!   因此并发 update 时最后一次写入胜出，不会有更新被在途写入覆盖
//! - clear 只用于运营方显式登出，瞬时断线不清凭据

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::record::SessionUpdate;
use crate::storage::{Storage, StorageError};

/// 不透明的认证材料（密钥 + 会话元数据），以 JSON 保存；Null 或空对象表示「无」
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialMaterial(serde_json::Value);

impl CredentialMaterial {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

// 日志里不输出密钥
impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("CredentialMaterial(empty)")
        } else {
            f.write_str("CredentialMaterial(<redacted>)")
        }
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to load credentials: {0}")]
    Load(#[source] StorageError),

    /// 可重试：内存副本仍然有效，下一次 flush 会再写
    #[error("Credential write-through failed: {0}")]
    WriteThrough(#[source] StorageError),
}

#[derive(Debug)]
struct CachedCredentials {
    material: CredentialMaterial,
    /// 每次替换递增
    generation: u64,
}

/// 凭据缓存
pub struct CredentialCache {
    store: Arc<dyn Storage>,
    current: RwLock<CachedCredentials>,
    /// 已落库的 generation；写穿期间持有该锁
    persisted: Mutex<u64>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            current: RwLock::new(CachedCredentials {
                material: CredentialMaterial::empty(),
                generation: 0,
            }),
            persisted: Mutex::new(0),
        }
    }

    /// 启动时从会话记录读取一次；返回空材料表示需要重新配对
    pub async fn load(&self) -> Result<CredentialMaterial, CredentialError> {
        let record = self
            .store
            .read_session()
            .await
            .map_err(CredentialError::Load)?;
        let material = record.map(|r| r.credentials).unwrap_or_default();

        // 等在途写入结束，再把读到的值当作「已落库」
        let mut persisted = self.persisted.lock().await;
        let mut current = self.current.write().await;
        current.generation += 1;
        current.material = material.clone();
        *persisted = current.generation;

        tracing::debug!(empty = material.is_empty(), "Credentials loaded from session record");
        Ok(material)
    }

    pub async fn current(&self) -> CredentialMaterial {
        self.current.read().await.material.clone()
    }

    /// 只替换内存副本，不落库；返回新的 generation
    pub async fn replace(&self, material: CredentialMaterial) -> u64 {
        let mut current = self.current.write().await;
        current.generation += 1;
        current.material = material;
        current.generation
    }

    /// 替换并写穿
    pub async fn update(&self, material: CredentialMaterial) -> Result<(), CredentialError> {
        self.replace(material).await;
        self.flush().await
    }

    /// 清空内存与持久化的凭据（仅运营方登出）
    pub async fn clear(&self) -> Result<(), CredentialError> {
        self.replace(CredentialMaterial::empty()).await;
        self.flush().await
    }

    /// 内存副本是否领先于数据库
    pub async fn is_dirty(&self) -> bool {
        let persisted = *self.persisted.lock().await;
        self.current.read().await.generation > persisted
    }

    /// 把当前最新的材料写入会话记录；已是最新则直接返回
    pub async fn flush(&self) -> Result<(), CredentialError> {
        let mut persisted = self.persisted.lock().await;
        let (material, generation) = {
            let current = self.current.read().await;
            (current.material.clone(), current.generation)
        };
        if generation <= *persisted {
            return Ok(());
        }

        match self
            .store
            .write_session(&SessionUpdate::new().credentials(material))
            .await
        {
            Ok(()) => {
                *persisted = generation;
                tracing::debug!(generation, "Credentials written through to session record");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to persist credentials, keeping in-memory copy: {}",
                    e
                );
                Err(CredentialError::WriteThrough(e))
            }
        }
    }
}
