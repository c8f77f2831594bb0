use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::events::{JobProcessed, JobReceived, PoolEvent, RawEvent};
use super::fees::Commission;
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::store::LedgerStore;

/// job-received payloads waiting for their job-processed, keyed by request id.
/// Lives for exactly one batch.
#[derive(Debug, Default)]
struct CorrelationMap {
    pending: HashMap<String, JobReceived>,
}

impl CorrelationMap {
    fn insert(&mut self, job: JobReceived) {
        self.pending.insert(job.request_id.clone(), job);
    }

    fn take(&mut self, request_id: &str) -> Option<JobReceived> {
        self.pending.remove(request_id)
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-batch counters, returned from [`ReconciliationEngine::apply`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    /// Already logged, or repeated within the batch. Not logged again.
    pub duplicates: usize,
    pub applied: usize,
    pub malformed: usize,
    pub uncorrelated: usize,
    pub ignored: usize,
    pub unknown: usize,
    pub rejected: usize,
    /// Wei credited to pending fees by this batch
    pub credited: i64,
}

impl BatchSummary {
    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Applied => self.applied += 1,
            EventOutcome::Malformed => self.malformed += 1,
            EventOutcome::Uncorrelated => self.uncorrelated += 1,
            EventOutcome::Ignored => self.ignored += 1,
            EventOutcome::UnknownType => self.unknown += 1,
            EventOutcome::Rejected => self.rejected += 1,
        }
    }

    pub fn logged(&self) -> usize {
        self.received - self.duplicates
    }
}

/// Reconciliation engine - turns raw source events into ledger state
///
/// INVARIANTS:
/// - A batch is committed as one unit: all of its mutations and log entries, or none.
///   Only a credit the ledger refuses is dropped on its own, logged as rejected
/// - An event id already logged for the source has no effect
/// - Every new event gets exactly one log entry, whatever its outcome
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    region: String,
    commission: Commission,
    /// Node type assumed for events of a source when the payload carries none
    default_node_types: HashMap<String, String>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, region: &str, commission: Commission) -> Self {
        Self {
            store,
            region: region.to_string(),
            commission,
            default_node_types: HashMap::new(),
        }
    }

    /// Register the configured node type of a data source
    pub fn register_source(&mut self, source_id: &str, node_type: &str) {
        self.default_node_types
            .insert(source_id.to_string(), node_type.to_string());
    }

    pub fn commission(&self) -> Commission {
        self.commission
    }

    /// Apply an ordered batch of events from one source.
    #[instrument(skip(self, events), fields(source_id = %source_id, events = events.len()))]
    pub async fn apply(&self, events: &[RawEvent], source_id: &str) -> AppResult<BatchSummary> {
        if events.is_empty() {
            return Ok(BatchSummary::default());
        }

        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let already_logged = self.store.logged_event_ids(source_id, &ids).await?;

        let (batch, mut summary) = self.plan(events, source_id, &already_logged);

        if batch.is_empty() {
            debug!("Nothing new in batch ({} duplicates)", summary.duplicates);
            return Ok(summary);
        }

        let credits: HashMap<i64, i64> = batch
            .mutations
            .iter()
            .filter_map(|mutation| match mutation {
                LedgerMutation::AddPending {
                    amount, event_id, ..
                } => Some((*event_id, *amount)),
                _ => None,
            })
            .collect();

        let receipt = self.store.commit_batch(batch).await?;

        for event_id in &receipt.rejected_events {
            summary.applied -= 1;
            summary.rejected += 1;
            summary.credited = summary
                .credited
                .saturating_sub(credits.get(event_id).copied().unwrap_or_default());
        }

        info!(
            "Reconciled {} events: {} applied, {} skipped, {} duplicates, {} wei credited",
            summary.received,
            summary.applied,
            summary.logged() - summary.applied,
            summary.duplicates,
            summary.credited
        );

        Ok(summary)
    }

    /// Decide every mutation and log entry for a batch without touching the store.
    fn plan(
        &self,
        events: &[RawEvent],
        source_id: &str,
        already_logged: &HashSet<i64>,
    ) -> (LedgerBatch, BatchSummary) {
        let mut batch = LedgerBatch::new(source_id);
        let mut summary = BatchSummary {
            received: events.len(),
            ..Default::default()
        };
        let mut correlation = CorrelationMap::default();
        let mut seen = HashSet::with_capacity(events.len());

        for event in events {
            if already_logged.contains(&event.id) || !seen.insert(event.id) {
                debug!("Skipping already seen event {}", event.id);
                summary.duplicates += 1;
                continue;
            }

            let (event_type, outcome) = match event.envelope() {
                Ok(envelope) => {
                    let event_type = envelope.event_type.clone();
                    let outcome = match PoolEvent::from_envelope(envelope) {
                        Ok(pool_event) => self.dispatch(
                            pool_event,
                            event.id,
                            source_id,
                            &mut correlation,
                            &mut batch,
                            &mut summary,
                        ),
                        Err(e) => {
                            warn!("Malformed {} payload in event {}: {}", event_type, event.id, e);
                            EventOutcome::Malformed
                        }
                    };
                    (event_type, outcome)
                }
                Err(e) => {
                    warn!("Malformed envelope in event {}: {}", event.id, e);
                    (String::new(), EventOutcome::Malformed)
                }
            };

            summary.record(outcome);
            batch.events.push(EventLogEntry {
                source_id: source_id.to_string(),
                event_id: event.id,
                event_type,
                payload: event.payload.clone(),
                outcome,
                created_at: event.timestamp,
            });
        }

        if correlation.len() > 0 {
            debug!(
                "{} job-received events left unmatched at end of batch",
                correlation.len()
            );
        }

        (batch, summary)
    }

    fn dispatch(
        &self,
        event: PoolEvent,
        event_id: i64,
        source_id: &str,
        correlation: &mut CorrelationMap,
        batch: &mut LedgerBatch,
        summary: &mut BatchSummary,
    ) -> EventOutcome {
        match event {
            PoolEvent::WorkerConnected(worker) => {
                if worker.eth_address.trim().is_empty() {
                    return EventOutcome::Malformed;
                }
                let key = self.key(&worker.eth_address, &worker.node_type, source_id);
                batch.mutations.push(LedgerMutation::UpsertConnection {
                    key,
                    connected: true,
                    connection: worker.connection,
                });
                EventOutcome::Applied
            }
            PoolEvent::WorkerDisconnected(worker) => {
                if worker.eth_address.trim().is_empty() {
                    return EventOutcome::Malformed;
                }
                let key = self.key(&worker.eth_address, &worker.node_type, source_id);
                batch.mutations.push(LedgerMutation::UpsertConnection {
                    key,
                    connected: false,
                    connection: String::new(),
                });
                EventOutcome::Applied
            }
            PoolEvent::OrchestratorReset => {
                batch.mutations.push(LedgerMutation::DisconnectAll {
                    source_id: source_id.to_string(),
                });
                EventOutcome::Applied
            }
            PoolEvent::JobReceived(job) => {
                if self.node_type(&job.node_type, source_id) != CORRELATED_NODE_TYPE {
                    return EventOutcome::Ignored;
                }
                if job.request_id.is_empty() || job.eth_address.trim().is_empty() {
                    return EventOutcome::Malformed;
                }
                debug!(
                    "Job {} received by {} (model {}, pipeline {}, task {})",
                    job.request_id, job.eth_address, job.model_id, job.pipeline, job.task_id
                );
                correlation.insert(job);
                EventOutcome::Applied
            }
            PoolEvent::JobProcessed(job) => {
                self.credit_processed(job, event_id, source_id, correlation, batch, summary)
            }
            PoolEvent::Unknown(kind) => {
                warn!("Unknown event type '{}' from source {}", kind, source_id);
                EventOutcome::UnknownType
            }
        }
    }

    fn credit_processed(
        &self,
        job: JobProcessed,
        event_id: i64,
        source_id: &str,
        correlation: &mut CorrelationMap,
        batch: &mut LedgerBatch,
        summary: &mut BatchSummary,
    ) -> EventOutcome {
        let amount = match self.commission.apply(job.fees) {
            Ok(amount) => amount,
            Err(e) => {
                warn!("Rejected job-processed {}: {}", job.request_id, e);
                return EventOutcome::Rejected;
            }
        };

        let node_type = self.node_type(&job.node_type, source_id);
        let eth_address = if node_type == CORRELATED_NODE_TYPE {
            match correlation.take(&job.request_id) {
                Some(received) => received.eth_address,
                None => {
                    debug!("No job-received for request {}, dropping", job.request_id);
                    return EventOutcome::Uncorrelated;
                }
            }
        } else {
            job.eth_address
        };

        if eth_address.trim().is_empty() {
            return EventOutcome::Malformed;
        }

        debug!(
            "Job {} processed: {} units at {} wei/unit in {}ms (model {}, pipeline {})",
            job.request_id,
            job.compute_units,
            job.price_per_compute_unit,
            job.response_time,
            job.model_id,
            job.pipeline
        );

        let key = WorkerKey::new(&eth_address, &node_type, &self.region, source_id);
        batch.mutations.push(LedgerMutation::AddPending {
            key,
            amount,
            event_id,
        });
        summary.credited = summary.credited.saturating_add(amount);
        EventOutcome::Applied
    }

    fn key(&self, eth_address: &str, payload_node_type: &str, source_id: &str) -> WorkerKey {
        let node_type = self.node_type(payload_node_type, source_id);
        WorkerKey::new(eth_address, &node_type, &self.region, source_id)
    }

    fn node_type(&self, payload_node_type: &str, source_id: &str) -> String {
        if !payload_node_type.is_empty() {
            return payload_node_type.to_string();
        }
        self.default_node_types
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    const REGION: &str = "eu";
    const SOURCE_A: &str = "source-a";
    const SOURCE_B: &str = "source-b";

    fn engine(store: Arc<InMemoryLedgerStore>, commission: u8) -> ReconciliationEngine {
        let mut engine = ReconciliationEngine::new(
            store,
            REGION,
            Commission::try_from_percent(commission).unwrap(),
        );
        engine.register_source(SOURCE_A, "ai");
        engine.register_source(SOURCE_B, "transcode");
        engine
    }

    fn event(id: i64, event_type: &str, payload: Value) -> RawEvent {
        RawEvent {
            id,
            payload: json!({ "event_type": event_type, "payload": payload }),
            timestamp: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        }
    }

    fn received(id: i64, address: &str, request_id: &str) -> RawEvent {
        event(
            id,
            "job-received",
            json!({"ethAddress": address, "nodeType": "ai", "requestID": request_id}),
        )
    }

    fn processed(id: i64, request_id: &str, fees: i64) -> RawEvent {
        event(
            id,
            "job-processed",
            json!({"fees": fees, "nodeType": "ai", "requestID": request_id}),
        )
    }

    fn ai_key(address: &str) -> WorkerKey {
        WorkerKey::new(address, "ai", REGION, SOURCE_A)
    }

    #[tokio::test]
    async fn test_correlated_credit() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        let summary = engine
            .apply(&[received(1, "0xA", "r1"), processed(2, "r1", 500)], SOURCE_A)
            .await
            .unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(summary.credited, 500);
        let entry = store.get(&ai_key("0xa")).unwrap();
        assert_eq!(entry.pending_fees, 500);
        assert!(!entry.is_connected);
    }

    #[tokio::test]
    async fn test_commission_applied_to_credit() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 10);

        engine
            .apply(&[received(1, "0xa", "r1"), processed(2, "r1", 1000)], SOURCE_A)
            .await
            .unwrap();

        assert_eq!(store.get(&ai_key("0xa")).unwrap().pending_fees, 900);
    }

    #[tokio::test]
    async fn test_uncorrelated_event_is_logged_without_mutation() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        let summary = engine
            .apply(&[processed(7, "r-missing", 500)], SOURCE_A)
            .await
            .unwrap();

        assert_eq!(summary.uncorrelated, 1);
        assert!(store.list_all().await.unwrap().is_empty());

        let logged = store.events_for(SOURCE_A);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].event_id, 7);
        assert_eq!(logged[0].outcome, EventOutcome::Uncorrelated);
    }

    #[tokio::test]
    async fn test_correlation_does_not_span_batches() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        engine.apply(&[received(1, "0xa", "r1")], SOURCE_A).await.unwrap();
        let summary = engine.apply(&[processed(2, "r1", 500)], SOURCE_A).await.unwrap();

        assert_eq!(summary.uncorrelated, 1);
        assert!(store.get(&ai_key("0xa")).is_none());
    }

    #[tokio::test]
    async fn test_request_is_credited_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        let summary = engine
            .apply(
                &[
                    received(1, "0xa", "r1"),
                    processed(2, "r1", 500),
                    processed(3, "r1", 500),
                ],
                SOURCE_A,
            )
            .await
            .unwrap();

        assert_eq!(summary.uncorrelated, 1);
        assert_eq!(store.get(&ai_key("0xa")).unwrap().pending_fees, 500);
    }

    #[tokio::test]
    async fn test_transcode_credits_event_address() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        // Node type falls back to the source's configured type.
        let summary = engine
            .apply(
                &[
                    event(1, "job-received", json!({"ethAddress": "0xb", "requestID": "t1"})),
                    event(2, "job-processed", json!({"ethAddress": "0xB", "requestID": "t1", "fees": 300})),
                ],
                SOURCE_B,
            )
            .await
            .unwrap();

        assert_eq!(summary.ignored, 1);
        let key = WorkerKey::new("0xb", "transcode", REGION, SOURCE_B);
        assert_eq!(store.get(&key).unwrap().pending_fees, 300);
    }

    #[tokio::test]
    async fn test_replayed_window_is_idempotent() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);
        let batch = vec![received(1, "0xa", "r1"), processed(2, "r1", 500)];

        engine.apply(&batch, SOURCE_A).await.unwrap();
        let replay = engine.apply(&batch, SOURCE_A).await.unwrap();

        assert_eq!(replay.duplicates, 2);
        assert_eq!(store.get(&ai_key("0xa")).unwrap().pending_fees, 500);
        assert_eq!(store.events_for(SOURCE_A).len(), 2);
        assert_eq!(
            store.high_water_mark(SOURCE_A).await.unwrap(),
            Some(batch[1].timestamp)
        );
    }

    #[tokio::test]
    async fn test_overlapping_window_applies_only_new_events() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        engine
            .apply(&[received(1, "0xa", "r1"), processed(2, "r1", 500)], SOURCE_A)
            .await
            .unwrap();
        let summary = engine
            .apply(
                &[processed(2, "r1", 500), received(3, "0xa", "r2"), processed(4, "r2", 200)],
                SOURCE_A,
            )
            .await
            .unwrap();

        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.applied, 2);
        assert_eq!(store.get(&ai_key("0xa")).unwrap().pending_fees, 700);
    }

    #[tokio::test]
    async fn test_reset_scope_isolation() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);
        let connect = |id| {
            event(
                id,
                "worker-connected",
                json!({"ethAddress": "0xc", "nodeType": "transcode", "connection": "10.0.0.1:8935"}),
            )
        };

        engine.apply(&[connect(1)], SOURCE_A).await.unwrap();
        engine.apply(&[connect(1)], SOURCE_B).await.unwrap();
        engine
            .apply(&[event(2, "orchestrator-reset", json!({}))], SOURCE_A)
            .await
            .unwrap();

        let on_a = store.get(&WorkerKey::new("0xc", "transcode", REGION, SOURCE_A)).unwrap();
        let on_b = store.get(&WorkerKey::new("0xc", "transcode", REGION, SOURCE_B)).unwrap();
        assert!(!on_a.is_connected);
        assert_eq!(on_a.connection, "");
        assert!(on_b.is_connected);
        assert_eq!(on_b.connection, "10.0.0.1:8935");
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        engine
            .apply(
                &[
                    event(1, "worker-connected", json!({"ethAddress": "0xd", "connection": "host:1"})),
                    event(2, "worker-disconnected", json!({"ethAddress": "0xd"})),
                ],
                SOURCE_A,
            )
            .await
            .unwrap();

        let entry = store.get(&ai_key("0xd")).unwrap();
        assert!(!entry.is_connected);
        assert!(store.list_connected().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_do_not_abort_batch() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        let garbage = RawEvent {
            id: 1,
            payload: json!("{not json"),
            timestamp: Utc.timestamp_opt(1_700_000_001, 0).unwrap(),
        };
        let summary = engine
            .apply(
                &[
                    garbage,
                    event(2, "job-processed", json!({"requestID": "r1"})),
                    event(3, "price-update", json!({})),
                    received(4, "0xa", "r1"),
                    processed(5, "r1", 40),
                ],
                SOURCE_A,
            )
            .await
            .unwrap();

        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.applied, 2);
        assert_eq!(store.events_for(SOURCE_A).len(), 5);
        assert_eq!(store.get(&ai_key("0xa")).unwrap().pending_fees, 40);
    }

    #[tokio::test]
    async fn test_negative_fee_is_rejected_and_logged() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);

        let summary = engine
            .apply(&[received(1, "0xa", "r1"), processed(2, "r1", -10)], SOURCE_A)
            .await
            .unwrap();

        assert_eq!(summary.rejected, 1);
        assert!(store.get(&ai_key("0xa")).is_none());
        assert_eq!(store.events_for(SOURCE_A)[1].outcome, EventOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_overflowing_credit_does_not_stall_source() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = engine(store.clone(), 0);
        let full = WorkerKey::new("0xb", "transcode", REGION, SOURCE_B);
        store.add_pending(&full, i64::MAX - 10).await.unwrap();

        let credit = |id: i64, address: &str, fees: i64| {
            event(
                id,
                "job-processed",
                json!({"ethAddress": address, "requestID": format!("t{}", id), "fees": fees}),
            )
        };
        let events = [credit(1, "0xb", 20), credit(2, "0xc", 5), credit(3, "0xb", 7)];

        let summary = engine.apply(&events, SOURCE_B).await.unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.credited, 12);
        assert_eq!(store.get(&full).unwrap().pending_fees, i64::MAX - 3);
        let other = WorkerKey::new("0xc", "transcode", REGION, SOURCE_B);
        assert_eq!(store.get(&other).unwrap().pending_fees, 5);
        assert_eq!(store.events_for(SOURCE_B)[0].outcome, EventOutcome::Rejected);
        assert_eq!(
            store.high_water_mark(SOURCE_B).await.unwrap(),
            Some(events[2].timestamp)
        );

        // The window moved on; the same events are now plain duplicates.
        let replay = engine.apply(&events, SOURCE_B).await.unwrap();
        assert_eq!(replay.duplicates, 3);
        assert_eq!(store.get(&full).unwrap().pending_fees, i64::MAX - 3);
    }
}
