use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt::Debug;

use super::models::*;
use crate::error::AppResult;

/// Fee ledger + event log storage.
///
/// INVARIANTS every backend upholds:
/// - `add_pending` and `transfer_pending_to_paid` are atomic per key
/// - `transfer_pending_to_paid` never drives pending fees negative
/// - `commit_batch` is all-or-nothing, and rejects a batch carrying an event
///   already present in the log. The one exception is a credit that would
///   overflow the row: it alone is skipped, and its event is logged as rejected
/// - rows touched by `commit_batch` are read and written under the same lock, so
///   a concurrent `transfer_pending_to_paid` is never lost
#[async_trait]
pub trait LedgerStore: Debug + Send + Sync {
    /// Set connectivity for a key, creating the row if it is unseen.
    async fn upsert_connection(
        &self,
        key: &WorkerKey,
        connected: bool,
        connection: &str,
    ) -> AppResult<()>;

    /// Mark every row of `source_id` disconnected. Returns the number of rows touched.
    async fn disconnect_all(&self, source_id: &str) -> AppResult<u64>;

    /// Credit pending fees, creating a disconnected row if the key is unseen.
    async fn add_pending(&self, key: &WorkerKey, amount: i64) -> AppResult<()>;

    /// Move `amount` from pending to paid and append the payout record, atomically.
    async fn transfer_pending_to_paid(
        &self,
        key: &WorkerKey,
        amount: i64,
        tx_hash: &str,
    ) -> AppResult<PayoutRecord>;

    async fn list_all(&self) -> AppResult<Vec<WorkerLedgerEntry>>;

    async fn list_connected(&self) -> AppResult<Vec<WorkerLedgerEntry>>;

    async fn totals(&self) -> AppResult<LedgerTotals>;

    async fn list_payouts(&self) -> AppResult<Vec<PayoutRecord>>;

    /// Latest logged event timestamp for a source, `None` before the first poll.
    async fn high_water_mark(&self, source_id: &str) -> AppResult<Option<DateTime<Utc>>>;

    /// Subset of `event_ids` already present in the log for `source_id`.
    async fn logged_event_ids(&self, source_id: &str, event_ids: &[i64])
        -> AppResult<HashSet<i64>>;

    /// Apply every mutation and append every log entry of the batch as one unit.
    async fn commit_batch(&self, batch: LedgerBatch) -> AppResult<BatchReceipt>;
}
