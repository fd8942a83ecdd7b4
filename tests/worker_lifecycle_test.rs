//! Worker 端到端测试：脚本化引擎 + 内存 / SQLite 存储

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use wa_monitor::audit::AuditKind;
use wa_monitor::config::AppConfig;
use wa_monitor::connection::{ConnectionState, DisconnectCause};
use wa_monitor::core::WorkerError;
use wa_monitor::engine::{CloseReason, GroupInfo, ScriptedEngine, SessionInfo};
use wa_monitor::flags::{request_value, FlagName};
use wa_monitor::session::{CredentialMaterial, SessionRecord, SessionStatus};
use wa_monitor::storage::{MemoryStore, SqliteStore, Storage};
use wa_monitor::Worker;

fn test_config(base_ms: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.flags.poll_ms = 20;
    config.reconnect.base_ms = base_ms;
    config.reconnect.max_ms = base_ms * 4;
    config.reconnect.jitter_ms = 0;
    config.session.logout_timeout_secs = 1;
    config
}

fn account() -> SessionInfo {
    SessionInfo {
        jid: "15551234567:7@s.whatsapp.net".into(),
        name: None,
        push_name: Some("Ops Phone".into()),
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met: {}", what);
}

async fn wait_state(worker: &Worker, state: ConnectionState) {
    let mut rx = worker.connection().subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("snapshot channel closed");
}

async fn start(
    config: &AppConfig,
) -> (Worker, Arc<MemoryStore>, Arc<ScriptedEngine>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(ScriptedEngine::new());
    let worker = Worker::start(config, store.clone(), engine.clone())
        .await
        .unwrap();
    (worker, store, engine)
}

async fn connect(worker: &Worker, engine: &ScriptedEngine) {
    engine.latest().unwrap().opened(account());
    wait_state(worker, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_empty_credentials_publish_qr() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    assert!(engine.opened_with(0).unwrap().is_empty());

    engine.latest().unwrap().qr("ABC123");
    eventually("qr persisted", || {
        let store = store.clone();
        async move {
            let record = store.session().await.unwrap();
            record.active_qr(Utc::now()) == Some("ABC123")
        }
    })
    .await;

    let record = store.session().await.unwrap();
    assert_eq!(record.status, SessionStatus::Connecting);
    assert!(record.identity.is_none());
    assert_eq!(worker.snapshot().qr.as_deref(), Some("ABC123"));

    // 新二维码覆盖旧的
    engine.latest().unwrap().qr("DEF456");
    eventually("second qr persisted", || {
        let store = store.clone();
        async move { store.session().await.unwrap().active_qr(Utc::now()) == Some("DEF456") }
    })
    .await;

    worker.stop().await;
    let kinds = store.audit_kinds().await;
    assert_eq!(&kinds[..2], &[AuditKind::QrGenerated, AuditKind::QrGenerated]);
}

#[tokio::test]
async fn test_connect_persists_identity_and_credentials() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    let session = engine.latest().unwrap();
    session.qr("ABC123");
    let material = CredentialMaterial::new(json!({"creds": {"me": "15551234567"}}));
    session.credentials(material.clone());
    connect(&worker, &engine).await;

    let record = store.session().await.unwrap();
    assert_eq!(record.status, SessionStatus::Connected);
    assert!(record.detail.is_none());
    assert!(record.is_consistent());
    let identity = record.identity.unwrap();
    assert_eq!(identity.account_number, "15551234567");
    assert_eq!(identity.display_name.as_deref(), Some("Ops Phone"));

    eventually("credentials persisted", || {
        let store = store.clone();
        let material = material.clone();
        async move { store.session().await.unwrap().credentials == material }
    })
    .await;

    worker.stop().await;
    let entries = store.audit_entries().await;
    let connect = entries.iter().find(|e| e.kind == AuditKind::Connect).unwrap();
    assert_eq!(connect.detail["number"], "15551234567");
}

#[tokio::test]
async fn test_restart_reuses_stored_credentials() {
    let material = CredentialMaterial::new(json!({"creds": {"registrationId": 42}}));
    let mut record = SessionRecord::new();
    record.credentials = material.clone();
    let store = Arc::new(MemoryStore::with_session(record));
    let engine = Arc::new(ScriptedEngine::new());

    let worker = Worker::start(&test_config(60_000), store.clone(), engine.clone())
        .await
        .unwrap();
    assert_eq!(engine.opened_with(0), Some(material));
    worker.stop().await;
}

#[tokio::test]
async fn test_transient_disconnect_reconnects_with_reset_backoff() {
    let (worker, store, engine) = start(&test_config(20)).await;
    connect(&worker, &engine).await;

    engine
        .latest()
        .unwrap()
        .closed(CloseReason::transient("stream errored"));
    eventually("second session opened", || {
        let engine = engine.clone();
        async move { engine.session_count() == 2 }
    })
    .await;
    connect(&worker, &engine).await;
    assert_eq!(worker.snapshot().attempts, 0);

    engine.latest().unwrap().closed(CloseReason::with_status(515));
    eventually("third session opened", || {
        let engine = engine.clone();
        async move { engine.session_count() == 3 }
    })
    .await;

    worker.stop().await;
    let reconnects: Vec<_> = store
        .audit_entries()
        .await
        .into_iter()
        .filter(|e| e.kind == AuditKind::Reconnect)
        .collect();
    assert_eq!(reconnects.len(), 2);
    for entry in reconnects {
        assert_eq!(entry.detail["attempt"], 1);
        assert_eq!(entry.detail["delayMs"], 20);
    }
}

#[tokio::test]
async fn test_repeated_close_is_idempotent() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    connect(&worker, &engine).await;

    let session = engine.latest().unwrap();
    session.closed(CloseReason::transient("reset"));
    wait_state(&worker, ConnectionState::Disconnected(DisconnectCause::Transient)).await;
    worker.connection().current().await.unwrap();

    let writes = store.session_writes();
    let disconnects = store
        .audit_kinds()
        .await
        .iter()
        .filter(|k| **k == AuditKind::Disconnect)
        .count();

    session.closed(CloseReason::transient("reset again"));
    session.closed(CloseReason::logged_out());
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.connection().current().await.unwrap();

    assert_eq!(store.session_writes(), writes);
    let after = store
        .audit_kinds()
        .await
        .iter()
        .filter(|k| **k == AuditKind::Disconnect)
        .count();
    assert_eq!(after, disconnects);
    assert_eq!(
        worker.snapshot().state,
        ConnectionState::Disconnected(DisconnectCause::Transient)
    );
    worker.stop().await;
}

#[tokio::test]
async fn test_logged_out_close_does_not_retry() {
    let (worker, store, engine) = start(&test_config(10)).await;
    connect(&worker, &engine).await;

    engine.latest().unwrap().closed(CloseReason::with_status(401));
    wait_state(&worker, ConnectionState::Disconnected(DisconnectCause::LoggedOut)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.session_count(), 1);
    assert!(worker.snapshot().next_retry_at.is_none());
    let record = store.session().await.unwrap();
    assert_eq!(record.status, SessionStatus::Disconnected);
    assert!(record.identity.is_none());
    worker.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_retry() {
    let (worker, store, engine) = start(&test_config(150)).await;
    connect(&worker, &engine).await;

    engine.latest().unwrap().closed(CloseReason::transient("reset"));
    wait_state(&worker, ConnectionState::Disconnected(DisconnectCause::Transient)).await;
    assert!(worker.snapshot().next_retry_at.is_some());

    worker.stop().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.open_count(), 1);
    assert_eq!(worker.snapshot().state, ConnectionState::Stopped);
    let entries = store.audit_entries().await;
    let last = entries.last().unwrap();
    assert_eq!(last.kind, AuditKind::Disconnect);
    assert_eq!(last.detail["cause"], "manual");
}

#[tokio::test]
async fn test_disconnect_flag_logs_out_and_clears_credentials() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    let session = engine.latest().unwrap();
    session.credentials(CredentialMaterial::new(json!({"creds": {"me": "1555"}})));
    connect(&worker, &engine).await;
    eventually("credentials persisted", || {
        let store = store.clone();
        async move { !store.session().await.unwrap().credentials.is_empty() }
    })
    .await;

    store
        .write_flag(FlagName::Disconnect, request_value(Utc::now()))
        .await
        .unwrap();
    wait_state(&worker, ConnectionState::Disconnected(DisconnectCause::LoggedOut)).await;
    eventually("flag cleared and credentials wiped", || {
        let store = store.clone();
        async move {
            let flag = store.read_flag(FlagName::Disconnect).await.unwrap().unwrap();
            flag.value.is_none() && store.session().await.unwrap().credentials.is_empty()
        }
    })
    .await;

    assert_eq!(session.logout_count(), 1);
    assert_eq!(engine.session_count(), 1);
    worker.stop().await;
    assert!(store.audit_kinds().await.contains(&AuditKind::FlagHandled));
}

#[tokio::test]
async fn test_disconnect_flag_survives_hanging_logout() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(ScriptedEngine::new());
    engine.hang_logout(true);
    let worker = Worker::start(&test_config(60_000), store.clone(), engine.clone())
        .await
        .unwrap();
    connect(&worker, &engine).await;

    store
        .write_flag(FlagName::Disconnect, request_value(Utc::now()))
        .await
        .unwrap();
    wait_state(&worker, ConnectionState::Disconnected(DisconnectCause::LoggedOut)).await;
    worker.stop().await;
}

#[tokio::test]
async fn test_fetch_groups_flag_retried_until_connected() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    engine.set_groups(vec![
        GroupInfo {
            id: "120363@g.us".into(),
            subject: "Ops Room".into(),
            participants: Some(12),
        },
        GroupInfo {
            id: "120364@g.us".into(),
            subject: "Alerts".into(),
            participants: None,
        },
    ]);

    store
        .write_flag(FlagName::FetchGroups, request_value(Utc::now()))
        .await
        .unwrap();
    eventually("handler failure audited", || {
        let store = store.clone();
        async move { store.audit_kinds().await.contains(&AuditKind::Error) }
    })
    .await;
    assert!(store
        .read_flag(FlagName::FetchGroups)
        .await
        .unwrap()
        .unwrap()
        .value
        .is_some());

    connect(&worker, &engine).await;
    eventually("groups discovered", || {
        let store = store.clone();
        async move {
            let flag = store.read_flag(FlagName::FetchGroups).await.unwrap().unwrap();
            flag.value.is_none() && store.groups().await.len() == 2
        }
    })
    .await;

    worker.stop().await;
    let entries = store.audit_entries().await;
    let discovery = entries.iter().find(|e| e.kind == AuditKind::Discovery).unwrap();
    assert_eq!(discovery.detail["groups"], 2);
}

#[tokio::test]
async fn test_refresh_qr_flag_restarts_pairing() {
    let (worker, store, engine) = start(&test_config(60_000)).await;
    engine.latest().unwrap().qr("OLD");
    eventually("first qr persisted", || {
        let store = store.clone();
        async move { store.session().await.unwrap().active_qr(Utc::now()) == Some("OLD") }
    })
    .await;

    store
        .write_flag(FlagName::RefreshQr, request_value(Utc::now()))
        .await
        .unwrap();
    eventually("pairing restarted", || {
        let engine = engine.clone();
        async move { engine.session_count() == 2 }
    })
    .await;
    worker.connection().current().await.unwrap();

    // 旧会话的二维码不再被接受
    engine.session(0).unwrap().qr("STALE");
    engine.latest().unwrap().qr("NEW");
    eventually("new qr persisted", || {
        let store = store.clone();
        async move { store.session().await.unwrap().active_qr(Utc::now()) == Some("NEW") }
    })
    .await;
    worker.stop().await;
}

#[tokio::test]
async fn test_startup_fails_without_session_record() {
    let store = Arc::new(MemoryStore::new());
    store.fail_session_reads(true);
    let result = Worker::start(&test_config(1000), store, Arc::new(ScriptedEngine::new())).await;
    assert!(matches!(result, Err(WorkerError::SessionUnavailable(_))));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = test_config(1000);
    config.flags.poll_ms = 0;
    let result = Worker::start(
        &config,
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedEngine::new()),
    )
    .await;
    assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_sqlite_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wa.db");
    let material = CredentialMaterial::new(json!({"creds": {"registrationId": 7}}));

    {
        let store = Arc::new(SqliteStore::open(&path, 1).await.unwrap());
        let engine = Arc::new(ScriptedEngine::new());
        let worker = Worker::start(&test_config(60_000), store.clone(), engine.clone())
            .await
            .unwrap();
        engine.latest().unwrap().credentials(material.clone());
        connect(&worker, &engine).await;
        eventually("credentials persisted", || {
            let store = store.clone();
            let material = material.clone();
            async move { store.read_session().await.unwrap().unwrap().credentials == material }
        })
        .await;
        worker.stop().await;
        store.close().await;
    }

    let store = Arc::new(SqliteStore::open(&path, 1).await.unwrap());
    let record = store.read_session().await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Disconnected);
    assert!(record.identity.is_none());
    assert!(record.is_consistent());
    assert_eq!(record.credentials, material);

    let engine = Arc::new(ScriptedEngine::new());
    let worker = Worker::start(&test_config(60_000), store.clone(), engine.clone())
        .await
        .unwrap();
    assert_eq!(engine.opened_with(0), Some(material));
    worker.stop().await;
}
