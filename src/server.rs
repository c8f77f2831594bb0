use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{get_pool_status, health_check, list_payouts, list_workers, AppState},
    error::AppResult,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_pool_status))
        .route("/workers", get(list_workers))
        .route("/payouts", get(list_payouts))
        // Read-only projection, open to any origin
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve until `shutdown` flips to true; in-flight requests are allowed to finish.
pub async fn run_server(
    app: Router,
    bind_address: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handler::PoolInfo;
    use crate::api::models::{StatusResponse, WorkerResponse};
    use crate::error::{AppError, AppResult};
    use crate::ledger::memory::InMemoryLedgerStore;
    use crate::ledger::models::*;
    use crate::ledger::store::LedgerStore;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;
    use std::sync::Arc;
    use tower::ServiceExt;

    const ONE_ETH: i64 = 1_000_000_000_000_000_000;

    fn state(ledger: Arc<dyn LedgerStore>) -> AppState {
        AppState {
            ledger,
            pool: Arc::new(PoolInfo {
                commission: 10,
                version: "1.2.0".to_string(),
                region: "eu".to_string(),
                node_types: vec!["ai".to_string(), "transcode".to_string()],
            }),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(app: Router, uri: &str) -> (StatusCode, T) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_reports_ether_totals() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let key = WorkerKey::new("0xa", "ai", "eu", "src");
        store.add_pending(&key, 2 * ONE_ETH).await.unwrap();
        store
            .transfer_pending_to_paid(&key, ONE_ETH / 2, "0xtx")
            .await
            .unwrap();

        let (status, body): (_, StatusResponse) =
            get_json(create_app(state(store)), "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.commission, 10);
        assert_eq!(body.total_payouts, 0.5);
        assert_eq!(body.total_pending, 1.5);
        assert_eq!(body.node_types, vec!["ai", "transcode"]);
    }

    #[tokio::test]
    async fn test_workers_connected_filter() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .upsert_connection(&WorkerKey::new("0xa", "ai", "eu", "src"), true, "host:1")
            .await
            .unwrap();
        store
            .add_pending(&WorkerKey::new("0xb", "ai", "eu", "src"), 10)
            .await
            .unwrap();
        let app = create_app(state(store));

        let (_, all): (_, Vec<WorkerResponse>) = get_json(app.clone(), "/workers").await;
        let (_, connected): (_, Vec<WorkerResponse>) =
            get_json(app, "/workers?connected=true").await;

        assert_eq!(all.len(), 2);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].eth_address, "0xa");
        assert_eq!(connected[0].connection, "host:1");
    }

    /// Ledger whose every read fails.
    #[derive(Debug)]
    struct BrokenLedger;

    fn broken<T>() -> AppResult<T> {
        Err(AppError::Internal("ledger unavailable".to_string()))
    }

    #[async_trait]
    impl LedgerStore for BrokenLedger {
        async fn upsert_connection(&self, _: &WorkerKey, _: bool, _: &str) -> AppResult<()> {
            broken()
        }
        async fn disconnect_all(&self, _: &str) -> AppResult<u64> {
            broken()
        }
        async fn add_pending(&self, _: &WorkerKey, _: i64) -> AppResult<()> {
            broken()
        }
        async fn transfer_pending_to_paid(
            &self,
            _: &WorkerKey,
            _: i64,
            _: &str,
        ) -> AppResult<PayoutRecord> {
            broken()
        }
        async fn list_all(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
            broken()
        }
        async fn list_connected(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
            broken()
        }
        async fn totals(&self) -> AppResult<LedgerTotals> {
            broken()
        }
        async fn list_payouts(&self) -> AppResult<Vec<PayoutRecord>> {
            broken()
        }
        async fn high_water_mark(&self, _: &str) -> AppResult<Option<DateTime<Utc>>> {
            broken()
        }
        async fn logged_event_ids(&self, _: &str, _: &[i64]) -> AppResult<HashSet<i64>> {
            broken()
        }
        async fn commit_batch(&self, _: LedgerBatch) -> AppResult<BatchReceipt> {
            broken()
        }
    }

    #[tokio::test]
    async fn test_status_degrades_to_zero_totals() {
        let app = create_app(state(Arc::new(BrokenLedger)));

        let (status, body): (_, StatusResponse) = get_json(app.clone(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.total_payouts, 0.0);
        assert_eq!(body.total_pending, 0.0);
        assert_eq!(body.version, "1.2.0");

        let (status, body): (_, serde_json::Value) = get_json(app, "/workers").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error_code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_app(state(Arc::new(InMemoryLedgerStore::new())));
        let (status, body): (_, serde_json::Value) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
