use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use std::fmt;

/// Node type whose fees are only credited after a matching job-received event.
pub const CORRELATED_NODE_TYPE: &str = "ai";

const WEI_PER_ETHER: f64 = 1e18;

/// Identity of a ledger row.
///
/// A worker earning through two data sources gets two independent rows, so an
/// orchestrator reset on one source never touches the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    pub eth_address: String,
    pub node_type: String,
    pub region: String,
    pub source_id: String,
}

impl WorkerKey {
    /// Addresses are stored lowercase so that checksummed and plain spellings share a row.
    pub fn new(
        eth_address: &str,
        node_type: &str,
        region: &str,
        source_id: &str,
    ) -> Self {
        Self {
            eth_address: eth_address.trim().to_lowercase(),
            node_type: node_type.to_string(),
            region: region.to_string(),
            source_id: source_id.to_string(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.eth_address,
            self.node_type,
            self.region,
            self.source_id.chars().take(12).collect::<String>()
        )
    }
}

/// Worker ledger entry - the durable financial record for one worker and source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct WorkerLedgerEntry {
    pub eth_address: String,
    pub node_type: String,
    pub region: String,
    pub source_id: String,
    pub is_connected: bool,
    /// Wei credited but not yet disbursed. Never negative.
    pub pending_fees: i64,
    /// Cumulative wei disbursed. Never decreases.
    pub paid_fees: i64,
    pub connection: String,
    pub last_updated: DateTime<Utc>,
}

impl WorkerLedgerEntry {
    /// Fresh row for a key seen for the first time.
    pub fn new(key: &WorkerKey) -> Self {
        Self {
            eth_address: key.eth_address.clone(),
            node_type: key.node_type.clone(),
            region: key.region.clone(),
            source_id: key.source_id.clone(),
            is_connected: false,
            pending_fees: 0,
            paid_fees: 0,
            connection: String::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            eth_address: self.eth_address.clone(),
            node_type: self.node_type.clone(),
            region: self.region.clone(),
            source_id: self.source_id.clone(),
        }
    }
}

/// Outcome recorded next to every logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// Envelope or payload could not be decoded.
    Malformed,
    /// job-processed without a job-received in the same batch.
    Uncorrelated,
    /// Recognised event with no ledger effect (e.g. a transcode job-received).
    Ignored,
    UnknownType,
    /// Ledger rejected the mutation (e.g. negative fee).
    Rejected,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Malformed => "malformed",
            EventOutcome::Uncorrelated => "uncorrelated",
            EventOutcome::Ignored => "ignored",
            EventOutcome::UnknownType => "unknown_type",
            EventOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event log entry. Append-only; `created_at` is the event's own timestamp and
/// its maximum per source is the poll high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub source_id: String,
    pub event_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub outcome: EventOutcome,
    pub created_at: DateTime<Utc>,
}

/// Payout record, written together with the pending to paid transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PayoutRecord {
    pub id: i64,
    pub eth_address: String,
    pub tx_hash: String,
    pub amount: i64,
    pub region: String,
    pub node_type: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate fee totals across the ledger, in wei
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub pending: i64,
    pub paid: i64,
}

/// One ledger write produced by reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerMutation {
    UpsertConnection {
        key: WorkerKey,
        connected: bool,
        connection: String,
    },
    DisconnectAll {
        source_id: String,
    },
    /// Credit produced by one event. A credit the ledger refuses (overflow)
    /// is dropped alone and its event is logged as rejected.
    AddPending {
        key: WorkerKey,
        amount: i64,
        event_id: i64,
    },
}

/// Everything a reconciliation batch writes. Stores commit it as one unit,
/// apart from individually refused credits.
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    pub source_id: String,
    pub mutations: Vec<LedgerMutation>,
    pub events: Vec<EventLogEntry>,
}

impl LedgerBatch {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.events.is_empty()
    }
}

/// Result of a committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Events whose credit the ledger refused; logged with outcome `rejected`.
    pub rejected_events: Vec<i64>,
}

/// Wei to ether, for display only. Ledger arithmetic never goes through here.
pub fn wei_to_ether(wei: i64) -> f64 {
    wei as f64 / WEI_PER_ETHER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_key_normalizes_address() {
        let key = WorkerKey::new(" 0xABCdef ", "ai", "eu", "src");
        assert_eq!(key.eth_address, "0xabcdef");
        assert_eq!(key, WorkerKey::new("0xabcdef", "ai", "eu", "src"));
    }

    #[test]
    fn test_new_entry_starts_disconnected_and_empty() {
        let key = WorkerKey::new("0xa", "transcode", "us", "src");
        let entry = WorkerLedgerEntry::new(&key);
        assert!(!entry.is_connected);
        assert_eq!(entry.pending_fees, 0);
        assert_eq!(entry.paid_fees, 0);
        assert_eq!(entry.key(), key);
    }

    #[test]
    fn test_wei_to_ether() {
        assert_eq!(wei_to_ether(1_500_000_000_000_000_000), 1.5);
        assert_eq!(wei_to_ether(0), 0.0);
    }
}
