use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::{wei_to_ether, PayoutRecord, WorkerLedgerEntry};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Pool summary. Totals are ether for display; the ledger keeps wei.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub commission: u8,
    pub total_payouts: f64,
    pub total_pending: f64,
    pub version: String,
    pub region: String,
    pub node_types: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkersQuery {
    #[serde(default)]
    pub connected: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub eth_address: String,
    pub node_type: String,
    pub region: String,
    pub source_id: String,
    pub is_connected: bool,
    pub connection: String,
    pub pending_fees: i64,
    pub paid_fees: i64,
    pub pending_eth: f64,
    pub paid_eth: f64,
    pub last_updated: DateTime<Utc>,
}

impl From<WorkerLedgerEntry> for WorkerResponse {
    fn from(entry: WorkerLedgerEntry) -> Self {
        Self {
            pending_eth: wei_to_ether(entry.pending_fees),
            paid_eth: wei_to_ether(entry.paid_fees),
            eth_address: entry.eth_address,
            node_type: entry.node_type,
            region: entry.region,
            source_id: entry.source_id,
            is_connected: entry.is_connected,
            connection: entry.connection,
            pending_fees: entry.pending_fees,
            paid_fees: entry.paid_fees,
            last_updated: entry.last_updated,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PayoutResponse {
    pub eth_address: String,
    pub tx_hash: String,
    pub amount: i64,
    pub amount_eth: f64,
    pub region: String,
    pub node_type: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<PayoutRecord> for PayoutResponse {
    fn from(record: PayoutRecord) -> Self {
        Self {
            amount_eth: wei_to_ether(record.amount),
            eth_address: record.eth_address,
            tx_hash: record.tx_hash,
            amount: record.amount,
            region: record.region,
            node_type: record.node_type,
            source_id: record.source_id,
            created_at: record.created_at,
        }
    }
}
