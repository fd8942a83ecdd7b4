//! SQLite 持久化（sqlx）
//!
//! 表结构：
//! - wa_sessions：唯一一行会话记录（状态、二维码、身份、凭据）
//! - runtime_flags：运营方指令标志，value 为 NULL 表示空闲
//! - audit_log：只追加的审计日志
//! - wa_groups：群组发现结果

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{FlagRecord, Storage, StorageError};
use crate::audit::{AuditEntry, AuditKind};
use crate::config::StorageSection;
use crate::engine::GroupInfo;
use crate::flags::{FlagName, FlagRequest};
use crate::session::{CredentialMaterial, Identity, SessionDetail, SessionRecord, SessionStatus, SessionUpdate};

const SESSION_COLUMNS: &str =
    "id, status, detail, wa_name, wa_number, creds_json, last_status_at";

/// SQLite 存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 按配置打开数据库
    pub async fn connect(section: &StorageSection) -> Result<Self, StorageError> {
        Self::open(&section.database_path, section.max_connections).await
    }

    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wa_sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                detail TEXT,
                wa_name TEXT,
                wa_number TEXT,
                creds_json TEXT,
                created_at TEXT NOT NULL,
                last_status_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runtime_flags (
                name TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wa_groups (
                id TEXT PRIMARY KEY,
                wa_group_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                monitor INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 最近的审计日志（按写入顺序）
    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT event, payload, created_at FROM
                (SELECT id, event, payload, created_at FROM audit_log ORDER BY id DESC LIMIT ?)
             ORDER BY id ASC",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let event: String = row.try_get("event")?;
            let payload: String = row.try_get("payload")?;
            let created_at: String = row.try_get("created_at")?;
            let Some(kind) = AuditKind::from_name(&event) else {
                continue;
            };
            entries.push(AuditEntry {
                kind,
                at: parse_time(&created_at).unwrap_or_else(Utc::now),
                detail: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }

    /// 已发现的群组：(wa_group_id, name, monitor)
    pub async fn list_groups(&self) -> Result<Vec<(String, String, bool)>, StorageError> {
        let rows = sqlx::query("SELECT wa_group_id, name, monitor FROM wa_groups ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("wa_group_id")?;
            let name: String = row.try_get("name")?;
            let monitor: i64 = row.try_get("monitor")?;
            groups.push((id, name, monitor != 0));
        }
        Ok(groups)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_session(&self) -> Result<Option<SessionRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM wa_sessions LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StorageError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let detail: Option<String> = row.try_get("detail")?;
    let wa_name: Option<String> = row.try_get("wa_name")?;
    let wa_number: Option<String> = row.try_get("wa_number")?;
    let creds_json: Option<String> = row.try_get("creds_json")?;
    let last_status_at: Option<String> = row.try_get("last_status_at")?;

    let detail = match detail {
        Some(raw) => serde_json::from_str::<Option<SessionDetail>>(&raw)?,
        None => None,
    };
    let credentials = match creds_json {
        Some(raw) => CredentialMaterial::new(serde_json::from_str(&raw)?),
        None => CredentialMaterial::empty(),
    };

    Ok(SessionRecord {
        id,
        status: SessionStatus::from_db(&status),
        detail,
        identity: wa_number.map(|account_number| Identity {
            display_name: wa_name,
            account_number,
        }),
        credentials,
        last_status_at: last_status_at.as_deref().and_then(parse_time),
    })
}

#[async_trait]
impl Storage for SqliteStore {
    async fn read_session(&self) -> Result<Option<SessionRecord>, StorageError> {
        self.fetch_session().await
    }

    async fn ensure_session(&self) -> Result<SessionRecord, StorageError> {
        if let Some(existing) = self.fetch_session().await? {
            return Ok(existing);
        }

        let record = SessionRecord::new();
        sqlx::query(
            "INSERT INTO wa_sessions (id, status, detail, wa_name, wa_number, creds_json, created_at)
             VALUES (?, ?, NULL, NULL, NULL, NULL, ?)",
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!("Created new wa_sessions row");
        Ok(record)
    }

    async fn write_session(&self, update: &SessionUpdate) -> Result<(), StorageError> {
        // 单条 UPDATE 完成合并，避免读改写之间被并发写入穿插
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE wa_sessions SET last_status_at = ");
        query.push_bind(Utc::now().to_rfc3339());

        if let Some(status) = update.status {
            query.push(", status = ").push_bind(status.as_str());
        }
        if let Some(detail) = &update.detail {
            let json = detail.as_ref().map(serde_json::to_string).transpose()?;
            query.push(", detail = ").push_bind(json);
        }
        if let Some(identity) = &update.identity {
            let (name, number) = match identity {
                Some(identity) => (identity.display_name.clone(), Some(identity.account_number.clone())),
                None => (None, None),
            };
            query.push(", wa_name = ").push_bind(name);
            query.push(", wa_number = ").push_bind(number);
        }
        if let Some(credentials) = &update.credentials {
            let json = if credentials.is_empty() {
                None
            } else {
                Some(serde_json::to_string(credentials.as_json())?)
            };
            query.push(", creds_json = ").push_bind(json);
        }

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SessionMissing);
        }
        Ok(())
    }

    async fn read_flag(&self, name: FlagName) -> Result<Option<FlagRecord>, StorageError> {
        let row = sqlx::query("SELECT value, updated_at FROM runtime_flags WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: Option<String> = row.try_get("value")?;
        let updated_at: String = row.try_get("updated_at")?;
        let value = match value {
            Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw)? {
                serde_json::Value::Null => None,
                v => Some(v),
            },
            None => None,
        };

        Ok(Some(FlagRecord {
            name,
            value,
            updated_at: parse_time(&updated_at),
        }))
    }

    async fn write_flag(&self, name: FlagName, value: serde_json::Value) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO runtime_flags (name, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(name.as_str())
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_flag(&self, name: FlagName) -> Result<(), StorageError> {
        sqlx::query("UPDATE runtime_flags SET value = NULL WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_flag_if(
        &self,
        name: FlagName,
        requested_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT value, updated_at FROM runtime_flags WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let Some(raw) = row.try_get::<Option<String>, _>("value")? else {
            return Ok(false);
        };
        let updated_at: String = row.try_get("updated_at")?;

        let record = FlagRecord {
            name,
            value: Some(serde_json::from_str(&raw)?),
            updated_at: parse_time(&updated_at),
        };
        if FlagRequest::from_record(&record).map(|r| r.requested_at) != Some(requested_at) {
            return Ok(false);
        }

        // 以读到的原始文本做比较交换，期间被改写则不清空
        let result = sqlx::query(
            "UPDATE runtime_flags SET value = NULL WHERE name = ? AND value = ? AND updated_at = ?",
        )
        .bind(name.as_str())
        .bind(&raw)
        .bind(&updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO audit_log (event, payload, created_at) VALUES (?, ?, ?)")
            .bind(entry.kind.as_str())
            .bind(serde_json::to_string(&entry.detail)?)
            .bind(entry.at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_groups(&self, groups: &[GroupInfo]) -> Result<usize, StorageError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for group in groups {
            sqlx::query(
                "INSERT INTO wa_groups (id, wa_group_id, name, monitor, created_at, updated_at)
                 VALUES (?, ?, ?, 0, ?, ?)
                 ON CONFLICT(wa_group_id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&group.id)
            .bind(&group.subject)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(groups.len())
    }
}
