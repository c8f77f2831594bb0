//! In-memory ledger backend with per-row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppResult, LedgerError};

type Row = Arc<Mutex<WorkerLedgerEntry>>;

#[derive(Debug, Default)]
struct EventLogState {
    entries: Vec<EventLogEntry>,
    ids_by_source: HashMap<String, HashSet<i64>>,
    high_water_marks: HashMap<String, DateTime<Utc>>,
}

/// [`LedgerStore`] kept in process memory.
///
/// Single-row operations hold the map read lock plus that row's mutex, so
/// unrelated workers never serialize on each other. Batches take the map write
/// lock, which makes a whole batch visible at once, and additionally hold the
/// mutex of every existing row they write.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    workers: RwLock<HashMap<WorkerKey, Row>>,
    events: RwLock<EventLogState>,
    payouts: Mutex<Vec<PayoutRecord>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of one row, for inspection.
    #[cfg(test)]
    pub fn get(&self, key: &WorkerKey) -> Option<WorkerLedgerEntry> {
        self.workers.read().get(key).map(|row| row.lock().clone())
    }

    /// Logged events of a source in arrival order.
    #[cfg(test)]
    pub fn events_for(&self, source_id: &str) -> Vec<EventLogEntry> {
        self.events
            .read()
            .entries
            .iter()
            .filter(|e| e.source_id == source_id)
            .cloned()
            .collect()
    }

    fn row(&self, key: &WorkerKey) -> Row {
        if let Some(row) = self.workers.read().get(key) {
            return row.clone();
        }
        self.workers
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(WorkerLedgerEntry::new(key))))
            .clone()
    }

    fn snapshot(&self, filter: impl Fn(&WorkerLedgerEntry) -> bool) -> Vec<WorkerLedgerEntry> {
        let mut rows: Vec<WorkerLedgerEntry> = self
            .workers
            .read()
            .values()
            .map(|row| row.lock().clone())
            .filter(|entry| filter(entry))
            .collect();
        rows.sort_by(|a, b| {
            (&a.eth_address, &a.node_type, &a.source_id).cmp(&(
                &b.eth_address,
                &b.node_type,
                &b.source_id,
            ))
        });
        rows
    }
}

fn checked_credit(entry: &mut WorkerLedgerEntry, key: &WorkerKey, amount: i64) -> AppResult<()> {
    if amount < 0 {
        return Err(LedgerError::NegativeAmount(amount).into());
    }
    entry.pending_fees = entry
        .pending_fees
        .checked_add(amount)
        .ok_or_else(|| LedgerError::Overflow { key: key.clone() })?;
    entry.last_updated = Utc::now();
    Ok(())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_connection(
        &self,
        key: &WorkerKey,
        connected: bool,
        connection: &str,
    ) -> AppResult<()> {
        let row = self.row(key);
        let mut entry = row.lock();
        entry.is_connected = connected;
        entry.connection = connection.to_string();
        entry.last_updated = Utc::now();
        Ok(())
    }

    async fn disconnect_all(&self, source_id: &str) -> AppResult<u64> {
        let workers = self.workers.read();
        let mut touched = 0;
        for (key, row) in workers.iter() {
            if key.source_id == source_id {
                let mut entry = row.lock();
                entry.is_connected = false;
                entry.connection.clear();
                entry.last_updated = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn add_pending(&self, key: &WorkerKey, amount: i64) -> AppResult<()> {
        let row = self.row(key);
        let mut entry = row.lock();
        checked_credit(&mut entry, key, amount)
    }

    async fn transfer_pending_to_paid(
        &self,
        key: &WorkerKey,
        amount: i64,
        tx_hash: &str,
    ) -> AppResult<PayoutRecord> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount).into());
        }
        let row = self
            .workers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound { key: key.clone() })?;

        let mut entry = row.lock();
        if entry.pending_fees < amount {
            return Err(LedgerError::InsufficientPending {
                key: key.clone(),
                requested: amount,
                available: entry.pending_fees,
            }
            .into());
        }
        let paid = entry
            .paid_fees
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow { key: key.clone() })?;

        // Record under the row lock so payouts and paid_fees never disagree.
        let mut payouts = self.payouts.lock();
        let record = PayoutRecord {
            id: payouts.len() as i64 + 1,
            eth_address: key.eth_address.clone(),
            tx_hash: tx_hash.to_string(),
            amount,
            region: key.region.clone(),
            node_type: key.node_type.clone(),
            source_id: key.source_id.clone(),
            created_at: Utc::now(),
        };
        payouts.push(record.clone());

        entry.pending_fees -= amount;
        entry.paid_fees = paid;
        entry.last_updated = Utc::now();
        Ok(record)
    }

    async fn list_all(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
        Ok(self.snapshot(|_| true))
    }

    async fn list_connected(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
        Ok(self.snapshot(|entry| entry.is_connected))
    }

    async fn totals(&self) -> AppResult<LedgerTotals> {
        let workers = self.workers.read();
        let mut totals = LedgerTotals::default();
        for row in workers.values() {
            let entry = row.lock();
            totals.pending = totals.pending.saturating_add(entry.pending_fees);
            totals.paid = totals.paid.saturating_add(entry.paid_fees);
        }
        Ok(totals)
    }

    /// Newest first, matching the Postgres backend.
    async fn list_payouts(&self) -> AppResult<Vec<PayoutRecord>> {
        Ok(self.payouts.lock().iter().rev().cloned().collect())
    }

    async fn high_water_mark(&self, source_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self.events.read().high_water_marks.get(source_id).copied())
    }

    async fn logged_event_ids(
        &self,
        source_id: &str,
        event_ids: &[i64],
    ) -> AppResult<HashSet<i64>> {
        let events = self.events.read();
        let Some(known) = events.ids_by_source.get(source_id) else {
            return Ok(HashSet::new());
        };
        Ok(event_ids
            .iter()
            .filter(|id| known.contains(id))
            .copied()
            .collect())
    }

    async fn commit_batch(&self, batch: LedgerBatch) -> AppResult<BatchReceipt> {
        let mut workers = self.workers.write();
        let mut events = self.events.write();

        if let Some(known) = events.ids_by_source.get(&batch.source_id) {
            if let Some(dup) = batch.events.iter().find(|e| known.contains(&e.event_id)) {
                return Err(LedgerError::DuplicateEvent {
                    source_id: batch.source_id.clone(),
                    event_id: dup.event_id,
                }
                .into());
            }
        }

        // Existing rows stay locked from read to write-back. A payout already
        // holding one of them finishes first; none can land in between.
        let touched = Touched::of(&batch);
        let rows: Vec<(WorkerKey, Row)> = workers
            .iter()
            .filter(|(key, _)| touched.contains(key))
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();
        let mut guards: HashMap<&WorkerKey, MutexGuard<'_, WorkerLedgerEntry>> =
            rows.iter().map(|(key, row)| (key, row.lock())).collect();

        let mut staged: HashMap<WorkerKey, WorkerLedgerEntry> = guards
            .iter()
            .map(|(key, entry)| ((*key).clone(), (**entry).clone()))
            .collect();
        let mut rejected = Vec::new();

        for mutation in &batch.mutations {
            match mutation {
                LedgerMutation::UpsertConnection {
                    key,
                    connected,
                    connection,
                } => {
                    let entry = staged
                        .entry(key.clone())
                        .or_insert_with(|| WorkerLedgerEntry::new(key));
                    entry.is_connected = *connected;
                    entry.connection = connection.clone();
                    entry.last_updated = Utc::now();
                }
                LedgerMutation::DisconnectAll { source_id } => {
                    for entry in staged.values_mut() {
                        if &entry.source_id == source_id {
                            entry.is_connected = false;
                            entry.connection.clear();
                            entry.last_updated = Utc::now();
                        }
                    }
                }
                LedgerMutation::AddPending {
                    key,
                    amount,
                    event_id,
                } => {
                    let current = staged.get(key).cloned();
                    let mut entry = current.unwrap_or_else(|| WorkerLedgerEntry::new(key));
                    match checked_credit(&mut entry, key, *amount) {
                        Ok(()) => {
                            staged.insert(key.clone(), entry);
                        }
                        Err(e) => {
                            warn!("Credit for event {} refused: {}", event_id, e);
                            rejected.push(*event_id);
                        }
                    }
                }
            }
        }

        for (key, entry) in staged {
            match guards.get_mut(&key) {
                Some(guard) => **guard = entry,
                None => {
                    workers.insert(key, Arc::new(Mutex::new(entry)));
                }
            }
        }
        drop(guards);

        let source_id = batch.source_id.clone();
        for mut entry in batch.events {
            if rejected.contains(&entry.event_id) {
                entry.outcome = EventOutcome::Rejected;
            }
            events
                .ids_by_source
                .entry(source_id.clone())
                .or_default()
                .insert(entry.event_id);
            let mark = events
                .high_water_marks
                .entry(source_id.clone())
                .or_insert(entry.created_at);
            if entry.created_at > *mark {
                *mark = entry.created_at;
            }
            events.entries.push(entry);
        }

        debug!("Committed in-memory batch for source {}", source_id);
        Ok(BatchReceipt {
            rejected_events: rejected,
        })
    }
}

/// Keys a batch may write: named keys plus every row of a reset source.
struct Touched<'a> {
    keys: HashSet<&'a WorkerKey>,
    reset_sources: HashSet<&'a str>,
}

impl<'a> Touched<'a> {
    fn of(batch: &'a LedgerBatch) -> Self {
        let mut touched = Self {
            keys: HashSet::new(),
            reset_sources: HashSet::new(),
        };
        for mutation in &batch.mutations {
            match mutation {
                LedgerMutation::UpsertConnection { key, .. }
                | LedgerMutation::AddPending { key, .. } => {
                    touched.keys.insert(key);
                }
                LedgerMutation::DisconnectAll { source_id } => {
                    touched.reset_sources.insert(source_id.as_str());
                }
            }
        }
        touched
    }

    fn contains(&self, key: &WorkerKey) -> bool {
        self.keys.contains(key) || self.reset_sources.contains(key.source_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(address: &str, source: &str) -> WorkerKey {
        WorkerKey::new(address, "ai", "eu", source)
    }

    fn log_entry(source: &str, id: i64, secs: i64) -> EventLogEntry {
        EventLogEntry {
            source_id: source.to_string(),
            event_id: id,
            event_type: "worker-connected".to_string(),
            payload: serde_json::json!({}),
            outcome: EventOutcome::Applied,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_add_pending_creates_disconnected_row() {
        let store = InMemoryLedgerStore::new();
        let k = key("0xa", "s1");

        store.add_pending(&k, 250).await.unwrap();
        store.add_pending(&k, 50).await.unwrap();

        let entry = store.get(&k).unwrap();
        assert_eq!(entry.pending_fees, 300);
        assert!(!entry.is_connected);
    }

    #[tokio::test]
    async fn test_transfer_rejects_insufficient_and_missing() {
        let store = InMemoryLedgerStore::new();
        let k = key("0xa", "s1");

        let missing = store.transfer_pending_to_paid(&k, 1, "0x1").await;
        assert!(matches!(
            missing,
            Err(crate::error::AppError::Ledger(LedgerError::NotFound { .. }))
        ));

        store.add_pending(&k, 10).await.unwrap();
        let short = store.transfer_pending_to_paid(&k, 11, "0x1").await;
        assert!(matches!(
            short,
            Err(crate::error::AppError::Ledger(LedgerError::InsufficientPending {
                available: 10,
                ..
            }))
        ));
        assert_eq!(store.get(&k).unwrap().pending_fees, 10);
        assert!(store.list_payouts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_moves_fees_and_records_payout() {
        let store = InMemoryLedgerStore::new();
        let k = key("0xa", "s1");
        store.add_pending(&k, 100).await.unwrap();

        let record = store.transfer_pending_to_paid(&k, 60, "0xfeed").await.unwrap();
        assert_eq!(record.amount, 60);
        assert_eq!(record.tx_hash, "0xfeed");

        let entry = store.get(&k).unwrap();
        assert_eq!(entry.pending_fees, 40);
        assert_eq!(entry.paid_fees, 60);
        assert_eq!(
            store.totals().await.unwrap(),
            LedgerTotals { pending: 40, paid: 60 }
        );
    }

    #[tokio::test]
    async fn test_disconnect_all_is_scoped_to_source() {
        let store = InMemoryLedgerStore::new();
        store.upsert_connection(&key("0xa", "s1"), true, "10.0.0.1").await.unwrap();
        store.upsert_connection(&key("0xb", "s1"), true, "10.0.0.2").await.unwrap();
        store.upsert_connection(&key("0xa", "s2"), true, "10.0.0.3").await.unwrap();

        assert_eq!(store.disconnect_all("s1").await.unwrap(), 2);

        let connected = store.list_connected().await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].source_id, "s2");
        assert_eq!(store.get(&key("0xa", "s1")).unwrap().connection, "");
    }

    #[tokio::test]
    async fn test_overflowing_credit_is_rejected_alone() {
        let store = InMemoryLedgerStore::new();
        let k = key("0xa", "s1");
        store.add_pending(&k, i64::MAX - 1).await.unwrap();

        let mut batch = LedgerBatch::new("s1");
        batch.mutations.push(LedgerMutation::UpsertConnection {
            key: key("0xb", "s1"),
            connected: true,
            connection: "c".to_string(),
        });
        batch.mutations.push(LedgerMutation::AddPending {
            key: k.clone(),
            amount: 5,
            event_id: 2,
        });
        batch.mutations.push(LedgerMutation::AddPending {
            key: key("0xb", "s1"),
            amount: 5,
            event_id: 3,
        });
        batch.events.push(log_entry("s1", 1, 100));
        batch.events.push(log_entry("s1", 2, 101));
        batch.events.push(log_entry("s1", 3, 102));

        let receipt = store.commit_batch(batch).await.unwrap();

        assert_eq!(receipt.rejected_events, vec![2]);
        assert_eq!(store.get(&k).unwrap().pending_fees, i64::MAX - 1);
        let b = store.get(&key("0xb", "s1")).unwrap();
        assert!(b.is_connected);
        assert_eq!(b.pending_fees, 5);
        assert_eq!(
            store.high_water_mark("s1").await.unwrap(),
            Some(Utc.timestamp_opt(102, 0).unwrap())
        );
        let outcomes: Vec<EventOutcome> =
            store.events_for("s1").iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![EventOutcome::Applied, EventOutcome::Rejected, EventOutcome::Applied]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batches_never_undo_concurrent_payouts() {
        const START: i64 = 1_000_000;
        const BATCHES: i64 = 200;

        let store = Arc::new(InMemoryLedgerStore::new());
        let k = key("0xa", "s1");
        store.add_pending(&k, START).await.unwrap();

        let mut payers = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let k = k.clone();
            payers.push(tokio::spawn(async move {
                let mut paid: i64 = 0;
                for _ in 0..2_000 {
                    if store.transfer_pending_to_paid(&k, 1, "0xtx").await.is_ok() {
                        paid += 1;
                    }
                    tokio::task::yield_now().await;
                }
                paid
            }));
        }

        for id in 0..BATCHES {
            let mut batch = LedgerBatch::new("s1");
            batch.mutations.push(LedgerMutation::AddPending {
                key: k.clone(),
                amount: 1,
                event_id: id,
            });
            // Unrelated rows widen the window between reading and writing `k`.
            for filler in 0..100 {
                batch.mutations.push(LedgerMutation::AddPending {
                    key: key(&format!("0xf{}", filler), "s1"),
                    amount: 1,
                    event_id: id,
                });
            }
            batch.events.push(log_entry("s1", id, 100 + id));
            store.commit_batch(batch).await.unwrap();
            tokio::task::yield_now().await;
        }

        let mut paid: i64 = 0;
        for payer in payers {
            paid += payer.await.unwrap();
        }

        let entry = store.get(&k).unwrap();
        assert_eq!(entry.paid_fees, paid);
        assert_eq!(entry.pending_fees, START + BATCHES - paid);
        assert_eq!(store.list_payouts().await.unwrap().len() as i64, paid);
    }

    #[tokio::test]
    async fn test_commit_batch_tracks_high_water_mark_and_rejects_duplicates() {
        let store = InMemoryLedgerStore::new();

        let mut batch = LedgerBatch::new("s1");
        batch.events.push(log_entry("s1", 1, 200));
        batch.events.push(log_entry("s1", 2, 100));
        store.commit_batch(batch).await.unwrap();

        assert_eq!(
            store.high_water_mark("s1").await.unwrap(),
            Some(Utc.timestamp_opt(200, 0).unwrap())
        );
        assert_eq!(store.high_water_mark("s2").await.unwrap(), None);

        let known = store.logged_event_ids("s1", &[1, 2, 3]).await.unwrap();
        assert_eq!(known, HashSet::from([1, 2]));

        let mut replay = LedgerBatch::new("s1");
        replay.mutations.push(LedgerMutation::AddPending {
            key: key("0xa", "s1"),
            amount: 7,
            event_id: 2,
        });
        replay.events.push(log_entry("s1", 2, 100));
        assert!(store.commit_batch(replay).await.is_err());
        assert!(store.get(&key("0xa", "s1")).is_none());
    }

    #[tokio::test]
    async fn test_batch_disconnect_covers_rows_created_in_same_batch() {
        let store = InMemoryLedgerStore::new();
        let mut batch = LedgerBatch::new("s1");
        batch.mutations.push(LedgerMutation::UpsertConnection {
            key: key("0xa", "s1"),
            connected: true,
            connection: "c".to_string(),
        });
        batch.mutations.push(LedgerMutation::DisconnectAll {
            source_id: "s1".to_string(),
        });
        store.commit_batch(batch).await.unwrap();

        assert!(!store.get(&key("0xa", "s1")).unwrap().is_connected);
    }
}
