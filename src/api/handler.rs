use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

use super::models::*;
use crate::{
    error::AppResult,
    ledger::{
        models::{wei_to_ether, LedgerTotals},
        store::LedgerStore,
    },
};

/// Static pool facts served by `/status`
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub commission: u8,
    pub version: String,
    pub region: String,
    pub node_types: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub pool: Arc<PoolInfo>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

/// Pool status
/// GET /status
///
/// Never fails: a ledger read error degrades to zero totals.
pub async fn get_pool_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let totals = match state.ledger.totals().await {
        Ok(totals) => totals,
        Err(e) => {
            error!("Failed to read ledger totals: {}", e);
            LedgerTotals::default()
        }
    };

    Json(StatusResponse {
        commission: state.pool.commission,
        total_payouts: wei_to_ether(totals.paid),
        total_pending: wei_to_ether(totals.pending),
        version: state.pool.version.clone(),
        region: state.pool.region.clone(),
        node_types: state.pool.node_types.clone(),
    })
}

/// List workers, optionally only connected ones
/// GET /workers?connected=true
pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<WorkersQuery>,
) -> AppResult<Json<Vec<WorkerResponse>>> {
    let workers = if query.connected.unwrap_or(false) {
        state.ledger.list_connected().await?
    } else {
        state.ledger.list_all().await?
    };
    debug!("Listing {} workers", workers.len());

    Ok(Json(workers.into_iter().map(WorkerResponse::from).collect()))
}

/// GET /payouts
pub async fn list_payouts(State(state): State<AppState>) -> AppResult<Json<Vec<PayoutResponse>>> {
    let payouts = state.ledger.list_payouts().await?;
    Ok(Json(payouts.into_iter().map(PayoutResponse::from).collect()))
}
