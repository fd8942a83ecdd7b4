//! 健康检查与状态接口

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, ConnectionSnapshot};

pub fn create_router(connection: ConnectionManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(connection)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn status(State(connection): State<ConnectionManager>) -> Json<ConnectionSnapshot> {
    Json(connection.snapshot())
}

/// 监听 bind 地址直到 token 被取消
pub async fn serve(
    bind: &str,
    connection: ConnectionManager,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Worker HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(connection))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::audit::AuditSink;
    use crate::connection::{ConnectionDeps, ConnectionOptions};
    use crate::engine::ScriptedEngine;
    use crate::session::CredentialCache;
    use crate::storage::MemoryStore;

    fn manager() -> ConnectionManager {
        let store = Arc::new(MemoryStore::new());
        let (audit, _writer) = AuditSink::spawn(store.clone());
        ConnectionManager::spawn(ConnectionDeps {
            engine: Arc::new(ScriptedEngine::new()),
            store: store.clone(),
            credentials: Arc::new(CredentialCache::new(store)),
            audit,
            options: ConnectionOptions::default(),
        })
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_json(create_router(manager()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_status_reports_snapshot() {
        let (status, body) = get_json(create_router(manager()), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["attempts"], 0);
    }
}
