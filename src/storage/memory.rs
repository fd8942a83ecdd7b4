//! 内存存储
//!
//! 进程内实现，便于嵌入与测试；记录会话写入次数与审计历史，并可注入故障。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{FlagRecord, Storage, StorageError};
use crate::audit::{AuditEntry, AuditKind};
use crate::engine::GroupInfo;
use crate::flags::{FlagName, FlagRequest};
use crate::session::{SessionRecord, SessionUpdate};

#[derive(Debug, Default)]
struct Faults {
    session_reads: AtomicBool,
    session_writes: AtomicBool,
    flag_clears: AtomicBool,
    audit: AtomicBool,
    write_delay_ms: AtomicU64,
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    session: RwLock<Option<SessionRecord>>,
    flags: RwLock<HashMap<FlagName, FlagRecord>>,
    audit: RwLock<Vec<AuditEntry>>,
    groups: RwLock<BTreeMap<String, GroupInfo>>,
    session_writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有会话记录初始化（模拟进程重启后读到的旧数据）
    pub fn with_session(record: SessionRecord) -> Self {
        Self {
            session: RwLock::new(Some(record)),
            ..Self::default()
        }
    }

    pub async fn session(&self) -> Option<SessionRecord> {
        self.session.read().await.clone()
    }

    /// 成功写入会话记录的次数
    pub fn session_writes(&self) -> usize {
        self.session_writes.load(Ordering::SeqCst)
    }

    /// 观察到的最大并发会话写入数
    pub fn max_concurrent_session_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }

    pub async fn audit_kinds(&self) -> Vec<AuditKind> {
        self.audit.read().await.iter().map(|e| e.kind).collect()
    }

    pub async fn groups(&self) -> Vec<GroupInfo> {
        self.groups.read().await.values().cloned().collect()
    }

    pub fn fail_session_reads(&self, fail: bool) {
        self.faults.session_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_session_writes(&self, fail: bool) {
        self.faults.session_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_flag_clears(&self, fail: bool) {
        self.faults.flag_clears.store(fail, Ordering::SeqCst);
    }

    pub fn fail_audit(&self, fail: bool) {
        self.faults.audit.store(fail, Ordering::SeqCst);
    }

    /// 每次会话写入前的人为延迟（模拟慢 I/O）
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn read_session(&self) -> Result<Option<SessionRecord>, StorageError> {
        if self.faults.session_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("session read failed".into()));
        }
        Ok(self.session.read().await.clone())
    }

    async fn ensure_session(&self) -> Result<SessionRecord, StorageError> {
        if self.faults.session_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("session read failed".into()));
        }
        let mut session = self.session.write().await;
        Ok(session.get_or_insert_with(SessionRecord::new).clone())
    }

    async fn write_session(&self, update: &SessionUpdate) -> Result<(), StorageError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = self.faults.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = if self.faults.session_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("session write failed".into()))
        } else {
            let mut session = self.session.write().await;
            match session.as_mut() {
                Some(record) => {
                    update.apply_to(record, Utc::now());
                    self.session_writes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(StorageError::SessionMissing),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn read_flag(&self, name: FlagName) -> Result<Option<FlagRecord>, StorageError> {
        Ok(self.flags.read().await.get(&name).cloned())
    }

    async fn write_flag(&self, name: FlagName, value: serde_json::Value) -> Result<(), StorageError> {
        self.flags.write().await.insert(
            name,
            FlagRecord {
                name,
                value: Some(value),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn clear_flag(&self, name: FlagName) -> Result<(), StorageError> {
        if self.faults.flag_clears.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("flag clear failed".into()));
        }
        if let Some(flag) = self.flags.write().await.get_mut(&name) {
            flag.value = None;
        }
        Ok(())
    }

    async fn clear_flag_if(
        &self,
        name: FlagName,
        requested_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if self.faults.flag_clears.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("flag clear failed".into()));
        }
        let mut flags = self.flags.write().await;
        let Some(flag) = flags.get_mut(&name) else {
            return Ok(false);
        };
        match FlagRequest::from_record(flag) {
            Some(request) if request.requested_at == requested_at => {
                flag.value = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        if self.faults.audit.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("audit insert failed".into()));
        }
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn upsert_groups(&self, groups: &[GroupInfo]) -> Result<usize, StorageError> {
        let mut stored = self.groups.write().await;
        for group in groups {
            stored.insert(group.id.clone(), group.clone());
        }
        Ok(groups.len())
    }
}
